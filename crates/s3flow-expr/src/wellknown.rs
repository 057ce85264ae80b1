use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExprError;

/// Fixed, well-known expression names an image type's configuration may
/// define. Unlike dynamic filters and signed-URL parameter expressions,
/// these are decoded into structured Rust values instead of staying as raw
/// `rhai::Dynamic`/JSON.
pub const EXPR_PRODUCT_BASE_PATH: &str = "productBasePath";
pub const EXPR_GEONAMES: &str = "geonames";
pub const EXPR_LOCALIZATION: &str = "localization";
pub const EXPR_PRODUCT_INFO: &str = "productInfo";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geonames {
    pub display_name: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Localization {
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub entries: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub entries: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// Sentinel used in place of a display value when the `geonames` expression
/// fails to evaluate, matching the fallback the rest of the pipeline expects
/// rather than surfacing a hard error for a cosmetic field.
pub const GEONAMES_FALLBACK: &str = "No geonames found";

/// Builds the fallback [`Geonames`] value for a `geonames` evaluation
/// failure — a literal sentinel display name rather than an absent field,
/// per the error-handling design's treatment of this one cosmetic field.
pub fn geonames_fallback(now: DateTime<Utc>) -> Geonames {
    Geonames {
        display_name: GEONAMES_FALLBACK.to_string(),
        last_modified: now,
    }
}

pub fn decode<T: for<'de> Deserialize<'de>>(name: &str, value: &rhai::Dynamic, expected: &str) -> Result<T, ExprError> {
    rhai::serde::from_dynamic(value).map_err(|_| ExprError::DecodeFailed {
        name: name.to_string(),
        expected: expected.to_string(),
    })
}
