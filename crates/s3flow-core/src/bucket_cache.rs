use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use s3flow_expr::{EvalContext, ExpressionManager};
use s3flow_store::{ObjectStore, ObjectType};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::classifier::ClassifiedEvent;
use crate::config_model::{FileSelectorDef, FileSelectorKind, ImageTypeDef, PREVIEW_SELECTOR, TARGET_SELECTOR};
use crate::model::{DynamicInputEntry, ProductRecord, SignedUrlEntry, TargetEntry};
use crate::outbound::{OutEvent, OutEventKind};
use crate::paths::{record_dir, relative_to_base, sanitize};

#[cfg(feature = "monitoring")]
use crate::monitoring::Metrics;

/// How long a presigned URL stays valid before the next observed event must
/// regenerate it.
pub const SIGNED_URL_LIFETIME: Duration = Duration::seconds(7 * 24 * 60 * 60);

/// Relative subdirectory names under a product's cache directory.
const TARGETS_SUBDIR: &str = "__targets__";
const DYNAMIC_INPUTS_SUBDIR: &str = "__dynamic_input_files__";

struct BucketState {
    /// Keyed by base directory — the product's identity within this bucket.
    records: HashMap<String, ProductRecord>,
    /// One cancellable drop-timer handle per live product, keyed the same
    /// way. Cancelling stops the scheduled drop; an absent entry means the
    /// product either was never given one or has already been dropped.
    drop_timers: HashMap<String, CancellationToken>,
}

/// Errors from `apply_object_type_specific_hooks`'s internal dispatch.
/// The first two are silent no-ops; everything else is warn-logged without
/// emitting an outbound event.
enum HookError {
    AlreadyCached,
    NoEventNeeded,
    Other(String),
}

/// Owns the product records for a single bucket behind one read-write lock.
/// The write lock is held for the *entire* duration of create/remove
/// processing — including the download/presign I/O — so that at most one
/// update is ever in flight for a given bucket at a time: mutations are
/// serialized by the bucket lock, and signed-URL regeneration is never
/// concurrent for the same (bucket, objectKey). Reads (`get_all_images`,
/// `get_image`) take the shared side and never block on I/O.
pub struct BucketCache {
    bucket: String,
    cache_root: PathBuf,
    state: RwLock<BucketState>,
    store: Arc<dyn ObjectStore>,
    expr: Arc<ExpressionManager>,
    max_objects_age: Duration,
    full_product_protocol: Option<String>,
    full_product_root_url: Option<String>,
    outbound_tx: mpsc::Sender<OutEvent>,
    self_ref: std::sync::Weak<BucketCache>,
    #[cfg(feature = "monitoring")]
    metrics: Arc<Metrics>,
}

impl BucketCache {
    pub fn new(
        bucket: impl Into<String>,
        cache_root: PathBuf,
        store: Arc<dyn ObjectStore>,
        expr: Arc<ExpressionManager>,
        products: &crate::config_model::ProductsConfig,
        outbound_tx: mpsc::Sender<OutEvent>,
        #[cfg(feature = "monitoring")] metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            bucket: bucket.into(),
            cache_root,
            state: RwLock::new(BucketState {
                records: HashMap::new(),
                drop_timers: HashMap::new(),
            }),
            store,
            expr,
            max_objects_age: products.max_objects_age,
            full_product_protocol: products.full_product_protocol.clone(),
            full_product_root_url: products.full_product_root_url.clone(),
            outbound_tx,
            self_ref: weak.clone(),
            #[cfg(feature = "monitoring")]
            metrics,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn get_all_images(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<ProductRecord> {
        let state = self.state.read().await;
        state
            .records
            .values()
            .filter(|r| r.last_modified >= start && r.last_modified <= end)
            .cloned()
            .collect()
    }

    pub async fn get_image(&self, base_dir: &str) -> Option<ProductRecord> {
        self.state.read().await.records.get(base_dir).cloned()
    }

    pub async fn dump_base_dirs(&self) -> Vec<String> {
        self.state.read().await.records.keys().cloned().collect()
    }

    /// Dispatches a classified event to the create or remove path. Expects
    /// `event.base_dir` to already be resolved — the classifier supplies it
    /// directly for previews, the temporizer supplies it once known for
    /// everything else.
    pub async fn handle_event(&self, event: ClassifiedEvent, ty: &ImageTypeDef) {
        let Some(base_dir) = event.base_dir.clone() else {
            warn!(key = %event.event.object_key, "event reached the bucket cache without a base_dir, dropping");
            return;
        };

        let selector = match self.selector_for(ty, &event.object_type) {
            Some(selector) => selector,
            None => {
                debug!(object_type = ?event.object_type, "no file selector for this object type, dropping");
                return;
            }
        };

        use s3flow_store::EventType;
        match event.event.event_type {
            EventType::Create => self.handle_create_event(event, &base_dir, ty, selector).await,
            EventType::Remove => self.handle_remove_event(event, &base_dir, selector).await,
        }
    }

    fn selector_for<'a>(&self, ty: &'a ImageTypeDef, object_type: &ObjectType) -> Option<&'a FileSelectorDef> {
        match object_type {
            ObjectType::Preview => ty.preview_selector(),
            ObjectType::Target => ty.target_selector(),
            ObjectType::DynamicInput(name) => ty.selector_named(name),
            ObjectType::NotYetAssigned => None,
        }
    }

    /// Holds the bucket's write lock for the whole operation: monotonicity
    /// check, directory materialization, the download/presign hook, and the
    /// in-memory update are one atomic critical section from the caller's
    /// point of view. This is the direct analogue of the original's
    /// `sync.Mutex` held across the equivalent Go function.
    async fn handle_create_event(&self, event: ClassifiedEvent, base_dir: &str, ty: &ImageTypeDef, selector: &FileSelectorDef) {
        let mtime = event.event.object_last_modified;
        let relative = relative_to_base(base_dir, &event.event.object_key).to_string();

        let mut state = self.state.write().await;

        if let Some(record) = state.records.get(base_dir) {
            if !is_fresh(record, &event.object_type, &relative, mtime) {
                return;
            }
        }

        let is_new = !state.records.contains_key(base_dir);
        if is_new {
            let mut record = ProductRecord::new(
                self.bucket.clone(),
                base_dir.to_string(),
                sanitize(base_dir),
                crate::model::Classification {
                    img_group: event.group_name.clone(),
                    img_type: event.type_name.clone(),
                },
                mtime,
                event.event.object_key.clone(),
            );
            // Drop timers and the destruction deadline key off the event's
            // emit time, not the object's last-modified, per the original's
            // `setDropTimer(event.baseDir, event.Time)`.
            record.cache_add_time = event.event.time;

            let dir = record_dir(&self.cache_root, &self.bucket, base_dir);
            if let Err(err) = tokio::fs::create_dir_all(&dir).await {
                error!(base_dir, ?err, "failed to materialize product cache directory");
                return;
            }

            state.records.insert(base_dir.to_string(), record);
            self.register_drop_timer(&mut state, base_dir.to_string(), event.event.time + self.max_objects_age);

            #[cfg(feature = "monitoring")]
            self.metrics.record_products_created(&self.bucket);
        }

        let outcome = self
            .apply_object_type_specific_hooks(&mut state, base_dir, &relative, &event, ty, selector)
            .await;

        if outcome.is_ok() {
            self.update_well_known_fields(&mut state, base_dir, ty);
        }

        let Some(record) = state.records.get_mut(base_dir) else {
            return;
        };

        match outcome {
            Ok(payload) => {
                record.last_modified = record.last_modified.max(mtime);
                let object_type_name = object_type_category(&event.object_type);

                #[cfg(feature = "monitoring")]
                self.metrics.record_event_emitted(&self.bucket, "create");

                let _ = self
                    .outbound_tx
                    .send(OutEvent {
                        event_type: OutEventKind::ObjectCreated,
                        object_type: object_type_name,
                        image_bucket: self.bucket.clone(),
                        image_key: event.event.object_key.clone(),
                        object_time: mtime,
                        object: Some(payload),
                        error: None,
                    })
                    .await;
            }
            Err(HookError::AlreadyCached) | Err(HookError::NoEventNeeded) => {}
            Err(HookError::Other(message)) => {
                warn!(base_dir, key = %event.event.object_key, "create hook failed: {}", message);
            }
        }
    }

    async fn apply_object_type_specific_hooks(
        &self,
        state: &mut BucketState,
        base_dir: &str,
        relative: &str,
        event: &ClassifiedEvent,
        ty: &ImageTypeDef,
        selector: &FileSelectorDef,
    ) -> Result<serde_json::Value, HookError> {
        match &selector.kind {
            FileSelectorKind::Cached => self.apply_cached_hook(state, base_dir, relative, event, selector).await,
            FileSelectorKind::SignedUrl => self.apply_signed_url_hook(state, base_dir, event, ty, None).await,
            FileSelectorKind::FullProductSignedUrl { expr_name } => {
                self.apply_signed_url_hook(state, base_dir, event, ty, Some(expr_name)).await
            }
        }
    }

    async fn apply_cached_hook(
        &self,
        state: &mut BucketState,
        base_dir: &str,
        relative: &str,
        event: &ClassifiedEvent,
        selector: &FileSelectorDef,
    ) -> Result<serde_json::Value, HookError> {
        let dest = self.selector_path(base_dir, relative, &event.object_type);

        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            let matching_mtime = meta
                .modified()
                .map(|t| DateTime::<Utc>::from(t).timestamp() == event.event.object_last_modified.timestamp())
                .unwrap_or(false);

            if meta.len() as i64 == event.event.size && matching_mtime {
                return Err(HookError::AlreadyCached);
            }
        }

        self.store
            .download_object(&self.bucket, &event.event.object_key, &dest)
            .await
            .map_err(|err| HookError::Other(err.to_string()))?;

        let cache_key = dest
            .strip_prefix(&self.cache_root)
            .unwrap_or(&dest)
            .to_string_lossy()
            .into_owned();

        let Some(record) = state.records.get_mut(base_dir) else {
            return Err(HookError::NoEventNeeded);
        };

        match &event.object_type {
            ObjectType::Preview => {
                record.preview_cache_key = cache_key.clone();
                record.s3_key = event.event.object_key.clone();
            }
            ObjectType::Target => {
                record.targets.insert(
                    relative.to_string(),
                    TargetEntry {
                        cache_key: cache_key.clone(),
                        last_update: event.event.object_last_modified,
                    },
                );
            }
            ObjectType::DynamicInput(name) => {
                record.dynamic_input_files.insert(
                    name.clone(),
                    DynamicInputEntry {
                        s3_path: event.event.object_key.clone(),
                        cache_key: cache_key.clone(),
                        date: event.event.object_last_modified,
                        last_update: event.event.object_last_modified,
                    },
                );
                if selector.link {
                    record.links_from_cache.insert(event.event.object_key.clone(), cache_key.clone());
                }
            }
            ObjectType::NotYetAssigned => return Err(HookError::NoEventNeeded),
        }

        Ok(serde_json::json!({ "cacheKey": cache_key, "lastUpdate": event.event.object_last_modified }))
    }

    fn selector_path(&self, base_dir: &str, relative: &str, object_type: &ObjectType) -> PathBuf {
        let dir = record_dir(&self.cache_root, &self.bucket, base_dir);
        match object_type {
            ObjectType::Preview => dir.join(relative),
            ObjectType::Target => dir.join(TARGETS_SUBDIR).join(relative),
            ObjectType::DynamicInput(_) | ObjectType::NotYetAssigned => dir.join(DYNAMIC_INPUTS_SUBDIR).join(relative),
        }
    }

    async fn apply_signed_url_hook(
        &self,
        state: &mut BucketState,
        base_dir: &str,
        event: &ClassifiedEvent,
        ty: &ImageTypeDef,
        extra_params_expr: Option<&str>,
    ) -> Result<serde_json::Value, HookError> {
        let key = event.event.object_key.clone();
        let now = Utc::now();

        if let Some(record) = state.records.get(base_dir) {
            if let Some(existing) = record.signed_urls.get(&key) {
                let value_is_fresh = event.event.object_last_modified <= existing.last_update;
                if value_is_fresh && existing.is_valid(now, SIGNED_URL_LIFETIME) {
                    return Err(HookError::AlreadyCached);
                }
            }
        }

        let mut url = self
            .store
            .generate_signed_url(&self.bucket, &key)
            .await
            .map_err(|err| HookError::Other(err.to_string()))?;
        url = rewrite_signed_url(&url, self.full_product_protocol.as_deref(), self.full_product_root_url.as_deref());

        if let Some(expr_name) = extra_params_expr {
            match self.eval_extra_query_params(ty, expr_name, &event.event.object_key) {
                Ok(params) => url = append_query_params(&url, &params),
                Err(err) => warn!(expr_name, "fullProductSignedURL expression failed, presigning without extra params: {}", err),
            }
        }

        let Some(record) = state.records.get_mut(base_dir) else {
            return Err(HookError::NoEventNeeded);
        };

        record.signed_urls.insert(
            key.clone(),
            SignedUrlEntry {
                url: url.clone(),
                generation_date: now,
                last_update: event.event.object_last_modified,
            },
        );

        Ok(serde_json::json!({ "url": url, "generationDate": now }))
    }

    fn eval_extra_query_params(&self, ty: &ImageTypeDef, expr_name: &str, object_key: &str) -> Result<BTreeMap<String, String>, s3flow_expr::ExprError> {
        let env = EvalContext::with_prefix(BTreeMap::new(), ty.expr_prefix());
        let value = self.expr.eval(&self.bucket, object_key, expr_name, &env)?;
        s3flow_expr::decode(expr_name, &value, "map<string,string>")
    }

    /// Builds the `Files` environment the well-known expressions evaluate
    /// against, from the record's current preview and dynamic input files.
    fn record_eval_context(&self, record: &ProductRecord, ty: &ImageTypeDef) -> EvalContext {
        let mut files = BTreeMap::new();
        files.insert(
            PREVIEW_SELECTOR.to_string(),
            s3flow_expr::DynamicInputFile {
                s3_path: record.s3_key.clone(),
                cache_key: record.preview_cache_key.clone(),
                date: record.last_modified,
            },
        );
        for (name, entry) in &record.dynamic_input_files {
            files.insert(
                name.clone(),
                s3flow_expr::DynamicInputFile {
                    s3_path: entry.s3_path.clone(),
                    cache_key: entry.cache_key.clone(),
                    date: entry.date,
                },
            );
        }
        EvalContext::with_prefix(files, ty.expr_prefix())
    }

    /// Re-evaluates the three fixed well-known expressions — `geonames`,
    /// `localization`, `productInfo` — against the record's current file
    /// set, whenever that set may have changed. A type that does not define
    /// one of these leaves the corresponding field `None`. `geonames` falls
    /// back to a sentinel on evaluation failure (it is
    /// surfaced in every image summary); `localization`/`productInfo` are
    /// simply absent on failure since they are only rendered on demand.
    fn update_well_known_fields(&self, state: &mut BucketState, base_dir: &str, ty: &ImageTypeDef) {
        let Some(record) = state.records.get(base_dir) else { return };
        let env = self.record_eval_context(record, ty);
        let bucket = record.bucket.clone();
        let s3_key = record.s3_key.clone();

        let geonames_name = ty.expr_name(s3flow_expr::EXPR_GEONAMES);
        let geonames = if self.expr.is_registered(&geonames_name) {
            match self.expr.eval_as::<s3flow_expr::Geonames>(&bucket, &s3_key, &geonames_name, &env) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(base_dir, "geonames evaluation failed, using fallback: {}", err);
                    Some(s3flow_expr::geonames_fallback(Utc::now()))
                }
            }
        } else {
            None
        };

        let localization_name = ty.expr_name(s3flow_expr::EXPR_LOCALIZATION);
        let localization = if self.expr.is_registered(&localization_name) {
            match self.expr.eval_as::<s3flow_expr::Localization>(&bucket, &s3_key, &localization_name, &env) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(base_dir, "localization evaluation failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let product_info_name = ty.expr_name(s3flow_expr::EXPR_PRODUCT_INFO);
        let product_info = if self.expr.is_registered(&product_info_name) {
            match self.expr.eval_as::<s3flow_expr::ProductInfo>(&bucket, &s3_key, &product_info_name, &env) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(base_dir, "productInfo evaluation failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        if let Some(record) = state.records.get_mut(base_dir) {
            record.geonames = geonames;
            record.localization = localization;
            record.product_info = product_info;
        }
    }

    async fn handle_remove_event(&self, event: ClassifiedEvent, base_dir: &str, selector: &FileSelectorDef) {
        let is_preview_remove = matches!(event.object_type, ObjectType::Preview);

        if is_preview_remove {
            self.drop_product(base_dir).await;
            let _ = self
                .outbound_tx
                .send(OutEvent {
                    event_type: OutEventKind::ObjectRemoved,
                    object_type: object_type_category(&event.object_type),
                    image_bucket: self.bucket.clone(),
                    image_key: event.event.object_key.clone(),
                    object_time: event.event.object_last_modified,
                    object: None,
                    error: None,
                })
                .await;
            return;
        }

        let relative = relative_to_base(base_dir, &event.event.object_key).to_string();

        let removed = {
            let mut state = self.state.write().await;
            let Some(record) = state.records.get_mut(base_dir) else {
                return;
            };

            match &event.object_type {
                ObjectType::Target => record.targets.remove(&relative).is_some(),
                ObjectType::DynamicInput(name) => {
                    record.links_from_cache.remove(&event.event.object_key);
                    record.dynamic_input_files.remove(name).is_some()
                }
                ObjectType::Preview | ObjectType::NotYetAssigned => false,
            }
        };

        if !removed {
            return;
        }

        if matches!(selector.kind, FileSelectorKind::Cached) {
            let path = self.selector_path(base_dir, &relative, &event.object_type);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!(?path, ?err, "failed to remove cached file");
                }
            }
        }

        let _ = self
            .outbound_tx
            .send(OutEvent {
                event_type: OutEventKind::ObjectRemoved,
                object_type: object_type_category(&event.object_type),
                image_bucket: self.bucket.clone(),
                image_key: event.event.object_key.clone(),
                object_time: event.event.object_last_modified,
                object: None,
                error: None,
            })
            .await;
    }

    fn register_drop_timer(&self, state: &mut BucketState, base_dir: String, fire_at: DateTime<Utc>) {
        let cancel = CancellationToken::new();
        state.drop_timers.insert(base_dir.clone(), cancel.clone());

        let Some(this) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            let delay = (fire_at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    this.drop_product(&base_dir).await;
                }
            }
        });
    }

    /// Removes a product's record and on-disk directory. Idempotent: if the
    /// record is already gone (a concurrent preview-remove or a timer that
    /// already fired got there first), this is a no-op — satisfying the
    /// invariant that exactly one of a racing remove-event and drop-timer
    /// firing actually performs the drop.
    async fn drop_product(&self, base_dir: &str) {
        let mut state = self.state.write().await;
        if let Some(cancel) = state.drop_timers.remove(base_dir) {
            cancel.cancel();
        }
        let Some(_record) = state.records.remove(base_dir) else {
            return;
        };
        drop(state);

        let dir = record_dir(&self.cache_root, &self.bucket, base_dir);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!(?dir, ?err, "failed to remove dropped product directory");
            }
        }

        #[cfg(feature = "monitoring")]
        self.metrics.record_products_dropped(&self.bucket);

        debug!(base_dir, "product dropped");
    }
}

/// Enforces invariant 1: an event whose `ObjectLastModified` does not
/// strictly advance the stored `lastUpdate`/`lastModified` for its specific
/// field is a no-op.
fn is_fresh(record: &ProductRecord, object_type: &ObjectType, relative: &str, mtime: DateTime<Utc>) -> bool {
    match object_type {
        ObjectType::Preview => mtime > record.last_modified,
        ObjectType::Target => record.targets.get(relative).map(|t| mtime > t.last_update).unwrap_or(true),
        ObjectType::DynamicInput(name) => record
            .dynamic_input_files
            .get(name)
            .map(|d| mtime > d.last_update)
            .unwrap_or(true),
        ObjectType::NotYetAssigned => false,
    }
}

/// The `objectType` category carried on every outbound event — the fixed
/// `preview`/`target`/`dynamic_input` wire value, not the configured file
/// selector's name (which only coincides with it for preview/target).
fn object_type_category(object_type: &ObjectType) -> String {
    match object_type {
        ObjectType::Preview => PREVIEW_SELECTOR.to_string(),
        ObjectType::Target => TARGET_SELECTOR.to_string(),
        ObjectType::DynamicInput(_) => "dynamic_input".to_string(),
        ObjectType::NotYetAssigned => "dynamic_input".to_string(),
    }
}

/// Rewrites a presigned URL's scheme and host to the configured
/// `fullProductProtocol`/`fullProductRootURL` prefix, matching the
/// original's `FullProductProtocol + urlEscape(FullProductRootURL +
/// pathWithoutSchemeHost)`. A no-op when neither is configured.
fn rewrite_signed_url(raw: &str, protocol: Option<&str>, root_url: Option<&str>) -> String {
    if protocol.is_none() && root_url.is_none() {
        return raw.to_string();
    }

    let Ok(parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    let without_scheme_and_host = &parsed[url::Position::BeforePath..];
    let combined = format!("{}{}", root_url.unwrap_or(""), without_scheme_and_host);
    let escaped: String = url::form_urlencoded::byte_serialize(combined.as_bytes()).collect();

    format!("{}{}", protocol.unwrap_or(""), escaped)
}

fn append_query_params(url: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{url}{sep}{}", query.join("&"))
}
