use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use s3flow_expr::ExpressionManager;
use s3flow_store::ObjectStore;
use tokio::sync::mpsc;

use crate::bucket_cache::BucketCache;
use crate::classifier::ClassifiedEvent;
use crate::config_model::ProductsConfig;
use crate::error::CacheError;
use crate::model::{AllImageSummaries, Image};
use crate::outbound::OutEvent;
use crate::paths::is_safe_cache_relative_path;

#[cfg(feature = "monitoring")]
use crate::monitoring::Metrics;

/// Aggregates one [`BucketCache`] per configured bucket behind a single
/// read API, and is the sole writer into the outbound event channel the
/// fan-out task reads from. Dispatch is purely a `HashMap` lookup by
/// bucket name — all serialization happens inside each `BucketCache`, not
/// here, so events for different buckets never contend with each other.
pub struct GlobalCache {
    cache_root: PathBuf,
    products: Arc<ProductsConfig>,
    buckets: BTreeMap<String, Arc<BucketCache>>,
    outbound_tx: mpsc::Sender<OutEvent>,
}

impl GlobalCache {
    pub fn new(
        cache_root: PathBuf,
        products: Arc<ProductsConfig>,
        store: Arc<dyn ObjectStore>,
        expr: Arc<ExpressionManager>,
        outbound_tx: mpsc::Sender<OutEvent>,
        #[cfg(feature = "monitoring")] metrics: Arc<Metrics>,
    ) -> Self {
        let bucket_names: std::collections::BTreeSet<String> =
            products.image_groups.iter().map(|g| g.bucket.clone()).collect();

        let buckets = bucket_names
            .into_iter()
            .map(|bucket| {
                let cache = BucketCache::new(
                    bucket.clone(),
                    cache_root.clone(),
                    store.clone(),
                    expr.clone(),
                    &products,
                    outbound_tx.clone(),
                    #[cfg(feature = "monitoring")]
                    metrics.clone(),
                );
                (bucket, cache)
            })
            .collect();

        Self { cache_root, products, buckets, outbound_tx }
    }

    pub fn buckets(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Dispatches a classified event to its bucket's cache. A bucket not
    /// present in the configured product set is a configuration bug
    /// upstream (the classifier only forwards events it already resolved
    /// against this same `products` set) so this silently drops rather than
    /// erroring — there is nothing a caller could usefully do about it.
    pub async fn dispatch(&self, event: ClassifiedEvent) {
        let Some(cache) = self.buckets.get(&event.event.bucket) else {
            return;
        };
        let Some(ty) = self.products.type_def(&event.group_name, &event.type_name) else {
            return;
        };
        cache.handle_event(event, ty).await;
    }

    pub async fn get_all_images(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> AllImageSummaries {
        let mut out: AllImageSummaries = BTreeMap::new();
        for cache in self.buckets.values() {
            for record in cache.get_all_images(start, end).await {
                out.entry(record.classification.img_group.clone())
                    .or_default()
                    .entry(record.classification.img_type.clone())
                    .or_default()
                    .push(record.summary());
            }
        }
        out
    }

    pub async fn get_image(&self, bucket: &str, base_dir: &str) -> Result<Image, CacheError> {
        let cache = self.buckets.get(bucket).ok_or_else(|| CacheError::ImageNotFound {
            bucket: bucket.to_string(),
            key: base_dir.to_string(),
        })?;

        cache
            .get_image(base_dir)
            .await
            .map(|record| Image::from(&record))
            .ok_or_else(|| CacheError::ImageNotFound {
                bucket: bucket.to_string(),
                key: base_dir.to_string(),
            })
    }

    /// Resolves a cache key (as stored on a `ProductRecord`'s targets,
    /// dynamic inputs or preview) to the on-disk file it names, rejecting
    /// anything that would escape `cache_root`.
    pub fn get_cached_object(&self, cache_key: &str) -> Result<PathBuf, CacheError> {
        if !is_safe_cache_relative_path(cache_key) {
            return Err(CacheError::PathTraversal { key: cache_key.to_string() });
        }
        Ok(self.cache_root.join(cache_key))
    }

    /// `bucket -> base_dirs currently held`, for diagnostics/admin tooling.
    pub async fn dump_images(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        for (bucket, cache) in &self.buckets {
            out.insert(bucket.clone(), cache.dump_base_dirs().await);
        }
        out
    }

    /// Emits the synthetic `Reset` outbound event for `bucket` once its
    /// initial polling sweep has completed, so downstream consumers can
    /// discard any state accumulated before the cache had a complete view.
    /// A no-op for a bucket this cache wasn't configured with.
    pub async fn emit_reset(&self, bucket: &str) {
        if self.buckets.contains_key(bucket) {
            let _ = self.outbound_tx.send(OutEvent::reset(bucket)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_model::{FileSelectorDef, FileSelectorKind, ImageGroupDef, ImageTypeDef};
    use s3flow_expr::ExpressionManagerConfig;
    use s3flow_store::MockObjectStore;

    fn products() -> Arc<ProductsConfig> {
        Arc::new(ProductsConfig {
            image_groups: vec![ImageGroupDef {
                group_name: "G".to_string(),
                bucket: "b".to_string(),
                types: vec![ImageTypeDef {
                    group_name: "G".to_string(),
                    name: "T".to_string(),
                    display_name: "T".to_string(),
                    product_prefix: "p/".to_string(),
                    file_selectors: vec![FileSelectorDef {
                        name: "preview".to_string(),
                        regex: regex::Regex::new(r"preview\.jpg$").unwrap(),
                        kind: FileSelectorKind::Cached,
                        link: false,
                    }],
                    expressions: vec![],
                }],
            }],
            max_objects_age: chrono::Duration::days(1),
            retention_period: chrono::Duration::days(1),
            full_product_protocol: None,
            full_product_root_url: None,
            target_relative_regexp: None,
        })
    }

    fn global_cache(dir: &std::path::Path) -> (GlobalCache, mpsc::Receiver<OutEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let expr = Arc::new(ExpressionManager::new(ExpressionManagerConfig::default()));
        let store: Arc<dyn ObjectStore> = Arc::new(MockObjectStore::new());
        let cache = GlobalCache::new(
            dir.to_path_buf(),
            products(),
            store,
            expr,
            tx,
            #[cfg(feature = "monitoring")]
            Arc::new(Metrics::new_for_test()),
        );
        (cache, rx)
    }

    #[test]
    fn get_cached_object_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = global_cache(dir.path());
        assert!(cache.get_cached_object("b/p@1@2/preview.jpg").is_ok());
        assert!(cache.get_cached_object("../../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn unknown_bucket_image_lookup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = global_cache(dir.path());
        let err = cache.get_image("unconfigured", "p/1/2").await.unwrap_err();
        assert!(matches!(err, CacheError::ImageNotFound { .. }));
    }

    #[tokio::test]
    async fn emit_reset_sends_for_a_known_bucket_only() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut rx) = global_cache(dir.path());

        cache.emit_reset("unconfigured").await;
        assert!(rx.try_recv().is_err(), "an unconfigured bucket must not emit a reset");

        cache.emit_reset("b").await;
        let event = rx.recv().await.expect("expected a reset event for the configured bucket");
        assert_eq!(event.image_bucket, "b");
    }

    #[tokio::test]
    async fn dump_images_lists_every_configured_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = global_cache(dir.path());
        let dump = cache.dump_images().await;
        assert!(dump.contains_key("b"));
        assert!(dump["b"].is_empty());
    }
}
