//! Wires the classifier, temporizer and global cache together the same way
//! `s3flow-app`'s wiring layer does, minus the object source, to exercise
//! end-to-end ingestion scenarios without a live bucket.

use std::sync::Arc;

use chrono::{Duration, Utc};
use s3flow_core::{Classifier, FileSelectorDef, FileSelectorKind, GlobalCache, ImageGroupDef, ImageTypeDef, ProductsConfig, Temporizer};
use s3flow_expr::{ExpressionManager, ExpressionManagerConfig};
use s3flow_store::{Event, EventType, MockObjectStore, ObjectStore};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

fn products() -> Arc<ProductsConfig> {
    Arc::new(ProductsConfig {
        image_groups: vec![ImageGroupDef {
            group_name: "photos".to_string(),
            bucket: "b".to_string(),
            types: vec![ImageTypeDef {
                group_name: "photos".to_string(),
                name: "t".to_string(),
                display_name: "T".to_string(),
                product_prefix: "p/".to_string(),
                file_selectors: vec![
                    FileSelectorDef {
                        name: "preview".to_string(),
                        regex: regex::Regex::new(r"preview\.jpg$").unwrap(),
                        kind: FileSelectorKind::Cached,
                        link: false,
                    },
                    FileSelectorDef {
                        name: "target".to_string(),
                        regex: regex::Regex::new(r"target\.json$").unwrap(),
                        kind: FileSelectorKind::Cached,
                        link: false,
                    },
                ],
                expressions: vec![],
            }],
        }],
        max_objects_age: Duration::days(1),
        retention_period: Duration::days(1),
        full_product_protocol: None,
        full_product_root_url: None,
        target_relative_regexp: None,
    })
}

fn expr_manager() -> Arc<ExpressionManager> {
    let expr = Arc::new(ExpressionManager::new(ExpressionManagerConfig::default()));
    expr.compile("photos::t::productBasePath", r#"_replaceRegex(_s3Key("preview"), "/preview\\.jpg$", "")"#)
        .unwrap();
    expr
}

/// Wires classifier → temporizer/preview-passthrough → cache dispatch, the
/// same shape `s3flow_app::wiring::App::build` assembles, but fed directly
/// from a test-driven raw event channel instead of an object source.
struct Harness {
    raw_tx: mpsc::Sender<Event>,
    global_cache: Arc<GlobalCache>,
    outbound_rx: mpsc::Receiver<s3flow_core::OutEvent>,
    cancel: CancellationToken,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
    _cache_dir: tempfile::TempDir,
}

impl Harness {
    async fn build(store: Arc<dyn ObjectStore>) -> Harness {
        let products = products();
        let expr = expr_manager();
        let cancel = CancellationToken::new();

        let (raw_tx, raw_rx) = mpsc::channel(32);
        let (preview_tx, mut preview_rx) = mpsc::channel(32);
        let (sibling_tx, sibling_rx) = mpsc::channel(32);
        let (base_dir_tx, base_dir_rx) = broadcast::channel(32);
        let (released_tx, mut released_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::channel(32);

        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().to_path_buf();

        let global_cache = Arc::new(GlobalCache::new(
            cache_root,
            products.clone(),
            store,
            expr.clone(),
            outbound_tx,
            #[cfg(feature = "monitoring")]
            Arc::new(s3flow_core::Metrics::new().unwrap()),
        ));

        let mut tasks = Vec::new();

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

        let preview_forward_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = preview_forward_cancel.cancelled() => return,
                    event = preview_rx.recv() => {
                        let Some(event) = event else { return };
                        if released_tx.send(event).await.is_err() { return; }
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

        Harness { raw_tx, global_cache, outbound_rx, cancel, _tasks: tasks, _cache_dir: dir }
    }

    async fn send(&self, event: Event) {
        self.raw_tx.send(event).await.unwrap();
    }

    async fn shutdown(self) {
        self.cancel.cancel();
    }
}

fn preview_event(key: &str, mtime: chrono::DateTime<Utc>) -> Event {
    Event {
        time: Utc::now(),
        bucket: "b".to_string(),
        event_type: EventType::Create,
        object_type: None,
        size: 10,
        object_key: key.to_string(),
        object_last_modified: mtime,
    }
}

fn sibling_event(key: &str, mtime: chrono::DateTime<Utc>) -> Event {
    Event {
        time: Utc::now(),
        bucket: "b".to_string(),
        event_type: EventType::Create,
        object_type: None,
        size: 5,
        object_key: key.to_string(),
        object_last_modified: mtime,
    }
}

/// A bare preview create produces a product record and an `ObjectCreated`
/// outbound event.
#[tokio::test]
async fn preview_create_produces_a_product_record() {
    let mut mock = MockObjectStore::new();
    mock.expect_download_object().returning(|_, _, dest| {
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, b"jpeg").unwrap();
        Ok(())
    });

    let mut harness = Harness::build(Arc::new(mock)).await;
    let t0 = Utc::now();
    harness.send(preview_event("p/1/2/preview.jpg", t0)).await;

    let out = harness.outbound_rx.recv().await.expect("expected a create event");
    assert_eq!(out.object_type, "preview");
    assert_eq!(out.image_bucket, "b");

    let image = harness.global_cache.get_image("b", "p/1/2").await.unwrap();
    assert_eq!(image.summary.key, "p/1/2/preview.jpg");

    harness.shutdown().await;
}

/// An orphan sibling arriving before its preview is buffered by the
/// temporizer and released, in order, once the preview's base directory
/// becomes known — outbound events come out preview-then-target, never the
/// reverse.
#[tokio::test]
async fn orphan_sibling_is_released_in_order_after_its_preview_arrives() {
    let mut mock = MockObjectStore::new();
    mock.expect_download_object().returning(|_, _, dest| {
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, b"bytes").unwrap();
        Ok(())
    });

    let mut harness = Harness::build(Arc::new(mock)).await;
    let t0 = Utc::now();
    let t1 = t0 + Duration::seconds(1);

    harness.send(sibling_event("p/1/2/target.json", t0)).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    harness.send(preview_event("p/1/2/preview.jpg", t1)).await;

    let first = harness.outbound_rx.recv().await.expect("expected the preview create first");
    assert_eq!(first.object_type, "preview");

    let second = harness.outbound_rx.recv().await.expect("expected the released target next");
    assert_eq!(second.object_type, "target");

    let image = harness.global_cache.get_image("b", "p/1/2").await.unwrap();
    assert_eq!(image.target_files.len(), 1);

    harness.shutdown().await;
}

/// A stale create for an already-known object is a no-op end to end, not
/// just at the bucket-cache layer.
#[tokio::test]
async fn stale_preview_create_is_a_no_op_end_to_end() {
    let mut mock = MockObjectStore::new();
    mock.expect_download_object().times(1).returning(|_, _, dest| {
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, b"jpeg").unwrap();
        Ok(())
    });

    let mut harness = Harness::build(Arc::new(mock)).await;
    let t0 = Utc::now();
    harness.send(preview_event("p/1/2/preview.jpg", t0)).await;
    harness.outbound_rx.recv().await.unwrap();

    harness.send(preview_event("p/1/2/preview.jpg", t0 - Duration::seconds(1))).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(harness.outbound_rx.try_recv().is_err(), "a stale create must not reach the outbound stream");

    harness.shutdown().await;
}
