/// Errors surfaced by the bucket cache, global cache and classifier.
///
/// Most processing errors (stale events, unknown selectors, expression
/// failures on a cosmetic field) are logged and swallowed rather than
/// represented here — this enum is for conditions a caller needs to act on:
/// a read API asked about something that doesn't exist, or a read crossed a
/// boundary it shouldn't have.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no image found for bucket {bucket:?} and key {key:?}")]
    ImageNotFound { bucket: String, key: String },

    #[error("cache key {key:?} escapes the cache root")]
    PathTraversal { key: String },

    #[error("disk I/O error at {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object source error: {0}")]
    Store(#[from] s3flow_store::StoreError),

    #[error("expression evaluation error: {0}")]
    Expr(#[from] s3flow_expr::ExprError),
}
