//! Sandboxed expression compilation and evaluation for the s3flow ingestion
//! pipeline.
//!
//! Expressions are authored by deployment operators (not end users of the
//! running service) to derive display metadata — a product's base
//! directory, its geonames/localization/product-info payloads, dynamic
//! filters, and extra query parameters for signed URLs. They are compiled
//! once when configuration loads and evaluated many times as events arrive.
//! This crate has no knowledge of buckets, products or caches beyond the
//! narrow [`context::EvalContext`] it is handed per evaluation.

mod context;
mod engine;
mod error;
mod memo;
mod primitives;
mod wellknown;

pub use context::{DynamicInputFile, EvalContext};
pub use engine::{ExpressionManager, ExpressionManagerConfig};
pub use error::ExprError;
pub use memo::MEMO_TTL;
pub use primitives::JQ_TIMEOUT;
pub use wellknown::{
    decode, geonames_fallback, Geonames, Localization, ProductInfo, EXPR_GEONAMES, EXPR_LOCALIZATION,
    EXPR_PRODUCT_BASE_PATH, EXPR_PRODUCT_INFO, GEONAMES_FALLBACK,
};
