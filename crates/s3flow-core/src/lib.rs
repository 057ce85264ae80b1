//! Ingestion and assembly pipeline for the s3flow image cache: classifies
//! raw object-storage events, reassembles the siblings of a multi-file
//! product, maintains the on-disk cache and in-memory record for each one,
//! and fans the resulting create/remove events out to subscribers.
//!
//! This crate owns no network or disk I/O primitives of its own — those
//! live in `s3flow-store` — and no expression-language internals — those
//! live in `s3flow-expr`. It wires the two together around the product
//! record state machine described by the on-disk cache layout and
//! concurrency model.
//!
//! ## Module map
//!
//! - [`classifier`] resolves `(imageGroup, imageType, objectType)` for a raw
//!   event and computes `productBasePath` for previews.
//! - [`temporizer`] buffers sibling events that arrive before their
//!   product's base directory is known, and releases them once it is.
//! - [`bucket_cache`] owns one bucket's product records behind a
//!   read-write lock, applying create/remove effects and well-known
//!   expression evaluation.
//! - [`cache`] composes one [`bucket_cache::BucketCache`] per configured
//!   bucket behind a single read API.
//! - [`fanout`] multiplexes the outbound event stream to registered
//!   subscribers.
//! - [`model`] the product record and its summary/full-image projections.
//! - [`config_model`] the in-memory, already-validated configuration shape
//!   the application layer builds from parsed YAML.
//! - [`paths`] cache-path sanitization, traversal defense, and common-prefix
//!   arithmetic.
//! - [`outbound`] the wire shape of outbound events.
//! - [`error`] this crate's error taxonomy.
//! - [`monitoring`] Prometheus metrics, behind the `monitoring` feature.

pub mod bucket_cache;
pub mod cache;
pub mod classifier;
pub mod config_model;
pub mod error;
pub mod fanout;
pub mod model;
#[cfg(feature = "monitoring")]
pub mod monitoring;
pub mod outbound;
pub mod paths;
pub mod temporizer;

pub use bucket_cache::BucketCache;
pub use cache::GlobalCache;
pub use classifier::{ClassifiedEvent, Classifier};
pub use config_model::{
    qualified_expr_name, FileSelectorDef, FileSelectorKind, ImageGroupDef, ImageTypeDef, ProductsConfig,
    PREVIEW_SELECTOR, TARGET_SELECTOR,
};
pub use error::CacheError;
pub use fanout::{Fanout, Subscribe, SUBSCRIBER_QUEUE_DEPTH};
pub use model::{
    AllImageSummaries, CachedObject, Classification, DynamicInputEntry, Image, ImageSummary, ProductRecord,
    SignedUrlEntry, TargetEntry,
};
#[cfg(feature = "monitoring")]
pub use monitoring::Metrics;
pub use outbound::{OutEvent, OutEventKind};
pub use temporizer::Temporizer;
