//! Builds and runs the ingestion pipeline: one object source per configured
//! bucket, the classifier, the temporizer, the global cache, and the
//! outbound fan-out, all hung off a single root [`CancellationToken`] and
//! torn down in dependency order
//! (source → classifier → temporizer → cache → outbound → subscribers).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use s3flow_core::{paths, Classifier, Fanout, GlobalCache, Subscribe, Temporizer};
use s3flow_expr::ExpressionManager;
use s3flow_store::{NotificationSource, ObjectSource, ObjectStore, PollingSource, RawNotification, StoreClient};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigError};

const AWS_REGION: &str = "us-east-1";
const RAW_EVENT_QUEUE_DEPTH: usize = 256;
const BASE_DIR_BROADCAST_DEPTH: usize = 256;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Fatal conditions that prevent the pipeline from starting at all —
/// distinct from [`ConfigError`] and [`s3flow_store::StoreError`] since a
/// caller (`main`) wants one error type to match on for its exit code.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] s3flow_store::StoreError),

    #[cfg(feature = "monitoring")]
    #[error("failed to register Prometheus metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Everything spawned to serve one running process. Dropping this without
/// calling [`App::shutdown`] leaves the background tasks running detached;
/// callers should always shut down explicitly.
pub struct App {
    pub global_cache: Arc<GlobalCache>,
    pub subscribe_tx: mpsc::Sender<Subscribe>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    // Kept alive so a notification-mode source's channel never observes
    // upstream closure; no concrete notification transport is wired up yet,
    // so this sender is simply never used beyond keeping the receiver open.
    _notification_senders: Vec<mpsc::Sender<RawNotification>>,
}

impl App {
    /// Connects to the origin store, validates every configured bucket is
    /// reachable, and spawns the full pipeline. Returns once every task is
    /// running; a bucket that fails its existence check is a fatal startup
    /// error.
    pub async fn build(config: &Config) -> Result<App, StartupError> {
        let scheme = if config.s3.use_ssl { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}", config.s3.endpoint);

        let client = StoreClient::from_endpoint(
            &endpoint,
            AWS_REGION,
            &config.s3.access_id,
            &config.s3.access_secret,
            true,
        )
        .await;
        let store: Arc<dyn ObjectStore> = Arc::new(client);

        let (products, expr) = config.build_runtime()?;
        let expr: Arc<ExpressionManager> = expr;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut notification_senders = Vec::new();

        for bucket in config.configured_buckets() {
            if !store.bucket_exists(&bucket).await? {
                return Err(StartupError::Store(s3flow_store::StoreError::BucketUnavailable {
                    bucket: bucket.clone(),
                    message: "bucket existence check returned false".to_string(),
                }));
            }
        }

        // The narrowest prefix a bucket's object source needs to list/filter
        // under: the longest common prefix across all of its configured
        // image types' `productPrefix` values.
        let mut prefixes: BTreeMap<String, String> = BTreeMap::new();
        for bucket in config.configured_buckets() {
            let product_prefixes: Vec<String> = products
                .groups_for_bucket(&bucket)
                .flat_map(|group| group.types.iter().map(|ty| ty.product_prefix.clone()))
                .collect();
            prefixes.insert(bucket, paths::common_prefix(&product_prefixes));
        }

        let (raw_tx, raw_rx) = mpsc::channel(RAW_EVENT_QUEUE_DEPTH);
        let (preview_tx, preview_rx) = mpsc::channel(RAW_EVENT_QUEUE_DEPTH);
        let (sibling_tx, sibling_rx) = mpsc::channel(RAW_EVENT_QUEUE_DEPTH);
        let (base_dir_tx, base_dir_rx) = broadcast::channel(BASE_DIR_BROADCAST_DEPTH);
        let (released_tx, mut released_rx) = mpsc::channel(RAW_EVENT_QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (register_tx, register_rx) = mpsc::channel(16);

        #[cfg(feature = "monitoring")]
        let metrics = Arc::new(s3flow_core::Metrics::new()?);

        let global_cache = Arc::new(GlobalCache::new(
            config.cache.cache_dir.clone(),
            products.clone(),
            store.clone(),
            expr.clone(),
            outbound_tx,
            #[cfg(feature = "monitoring")]
            metrics,
        ));

        for bucket in config.configured_buckets() {
            let prefix = prefixes.get(&bucket).cloned().unwrap_or_default();
            let raw_tx = raw_tx.clone();
            let cancel = cancel.clone();
            let store = store.clone();
            let global_cache = global_cache.clone();
            let bucket_for_reset = bucket.clone();

            let (ready_tx, mut ready_rx) = mpsc::channel(1);
            let reset_cache = global_cache.clone();
            tasks.push(tokio::spawn(async move {
                if ready_rx.recv().await.is_some() {
                    reset_cache.emit_reset(&bucket_for_reset).await;
                }
            }));

            if config.s3.polling_mode {
                let source = PollingSource::new(store, bucket.clone(), prefix, config.s3.polling_period);
                tasks.push(tokio::spawn(async move {
                    if let Err(err) = source.run(raw_tx, Some(ready_tx), cancel).await {
                        error!(bucket = %bucket, "polling source exited with error: {}", err);
                    }
                }));
            } else {
                let (notification_tx, notification_rx) = mpsc::channel(1);
                notification_senders.push(notification_tx);

                let source = NotificationSource::new(store, bucket.clone(), prefix, notification_rx);
                tasks.push(tokio::spawn(async move {
                    if let Err(err) = source.run(raw_tx, Some(ready_tx), cancel).await {
                        error!(bucket = %bucket, "notification source exited with error: {}", err);
                    }
                }));
            }
        }
        drop(raw_tx);

        let classifier = Classifier::new(products.clone(), expr.clone());
        let classifier_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            classifier.run(raw_rx, preview_tx, sibling_tx, base_dir_tx, classifier_cancel).await;
        }));

        let temporizer = Temporizer::new(products.clone());
        let temporizer_cancel = cancel.clone();
        let released_tx_for_temporizer = released_tx.clone();
        tasks.push(tokio::spawn(async move {
            temporizer.run(sibling_rx, base_dir_rx, released_tx_for_temporizer, temporizer_cancel).await;
        }));

        // Previews bypass the temporizer (their base directory is already
        // known) but still funnel through the same release channel into the
        // cache dispatch loop below.
        let preview_forward_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut preview_rx = preview_rx;
            loop {
                tokio::select! {
                    _ = preview_forward_cancel.cancelled() => return,
                    event = preview_rx.recv() => {
                        let Some(event) = event else { return };
                        if released_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }));

        let dispatch_cancel = cancel.clone();
        let dispatch_cache = global_cache.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => return,
                    event = released_rx.recv() => {
                        let Some(event) = event else { return };
                        dispatch_cache.dispatch(event).await;
                    }
                }
            }
        }));

        let fanout_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            Fanout::new().run(outbound_rx, register_rx, fanout_cancel).await;
        }));

        info!(buckets = ?config.configured_buckets(), "ingestion pipeline started");

        Ok(App {
            global_cache,
            subscribe_tx: register_tx,
            cancel,
            tasks,
            _notification_senders: notification_senders,
        })
    }

    /// Cancels every task and waits for them to finish. The root token is
    /// shared by all tasks, so a single `cancel()` unwinds the whole
    /// pipeline; `tasks` are awaited in spawn order, which already matches
    /// the required source → classifier → temporizer → cache → outbound
    /// shutdown sequence since later stages only exit once their upstream
    /// channel closes.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        let joined = tokio::time::timeout(timeout, futures_join_all(self.tasks)).await;
        if joined.is_err() {
            error!("shutdown timed out waiting for pipeline tasks to exit");
        }
    }
}

async fn futures_join_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}
