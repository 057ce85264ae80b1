use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use s3flow_expr::{Geonames, Localization, ProductInfo};
use serde::{Deserialize, Serialize};

/// Classification tags attached to every event once the classifier has
/// resolved which configured image group/type it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub img_group: String,
    pub img_type: String,
}

/// A relative-cache-path entry for a target file, keyed by object key in
/// [`ProductRecord::targets`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub cache_key: String,
    pub last_update: DateTime<Utc>,
}

/// An entry under [`ProductRecord::dynamic_input_files`], one per configured
/// selector name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicInputEntry {
    pub s3_path: String,
    pub cache_key: String,
    pub date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// A presigned URL and the time it was generated, used to decide freshness
/// before regenerating on a repeat create event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedUrlEntry {
    pub url: String,
    pub generation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl SignedUrlEntry {
    pub fn is_valid(&self, now: DateTime<Utc>, lifetime: chrono::Duration) -> bool {
        now.signed_duration_since(self.generation_date) < lifetime
    }
}

/// A single product: the unit of identity the cache tracks, keyed by
/// `(bucket, base_dir)`. Mirrors the original's `Image`/`ImageSummary` pair
/// but flattened into one record, since the cache is the sole owner of both
/// halves and nothing else in this workspace needs them split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub bucket: String,
    pub base_dir: String,
    pub name: String,
    pub classification: Classification,

    pub last_modified: DateTime<Utc>,
    pub s3_key: String,
    pub preview_cache_key: String,

    pub targets: BTreeMap<String, TargetEntry>,
    pub dynamic_input_files: BTreeMap<String, DynamicInputEntry>,
    pub links_from_cache: BTreeMap<String, String>,
    pub signed_urls: BTreeMap<String, SignedUrlEntry>,

    #[serde(default)]
    pub geonames: Option<Geonames>,
    #[serde(default)]
    pub localization: Option<Localization>,
    #[serde(default)]
    pub product_info: Option<ProductInfo>,

    /// When this record was added to the cache — the base for its drop
    /// timer (`cache_add_time + max_objects_age`).
    pub cache_add_time: DateTime<Utc>,
}

impl ProductRecord {
    pub fn new(
        bucket: impl Into<String>,
        base_dir: impl Into<String>,
        name: impl Into<String>,
        classification: Classification,
        event_time: DateTime<Utc>,
        s3_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            base_dir: base_dir.into(),
            name: name.into(),
            classification,
            last_modified: event_time,
            s3_key: s3_key.into(),
            preview_cache_key: String::new(),
            targets: BTreeMap::new(),
            dynamic_input_files: BTreeMap::new(),
            links_from_cache: BTreeMap::new(),
            signed_urls: BTreeMap::new(),
            geonames: None,
            localization: None,
            product_info: None,
            cache_add_time: event_time,
        }
    }

    /// A flattened projection suitable for `GetAllImages`/`GetImage`
    /// responses, matching the original's `ImageSummary` field set.
    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            bucket: self.bucket.clone(),
            key: self.s3_key.clone(),
            name: self.name.clone(),
            group: self.classification.img_group.clone(),
            r#type: self.classification.img_type.clone(),
            geonames: self.geonames.clone(),
            product_info: self.product_info.clone(),
            cached_object: CachedObject {
                last_modified: self.last_modified,
                cache_key: self.preview_cache_key.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedObject {
    pub last_modified: DateTime<Utc>,
    pub cache_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub bucket: String,
    pub key: String,
    pub name: String,
    pub group: String,
    pub r#type: String,
    pub geonames: Option<Geonames>,
    pub product_info: Option<ProductInfo>,
    pub cached_object: CachedObject,
}

/// `group -> type -> summaries`, the shape `GetAllImages` returns.
pub type AllImageSummaries = BTreeMap<String, BTreeMap<String, Vec<ImageSummary>>>;

/// The full per-product projection `GetImage` returns — the summary plus
/// the fields too heavy or too rarely needed to carry on every listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub summary: ImageSummary,
    pub localization: Option<Localization>,
    pub cached_file_links: BTreeMap<String, String>,
    pub signed_urls: BTreeMap<String, String>,
    pub target_files: Vec<String>,
}

impl From<&ProductRecord> for Image {
    fn from(record: &ProductRecord) -> Self {
        Self {
            summary: record.summary(),
            localization: record.localization.clone(),
            cached_file_links: record.links_from_cache.clone(),
            signed_urls: record
                .signed_urls
                .iter()
                .map(|(key, entry)| (key.clone(), entry.url.clone()))
                .collect(),
            target_files: record.targets.values().map(|t| t.cache_key.clone()).collect(),
        }
    }
}
