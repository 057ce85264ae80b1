/// Errors surfaced by [`crate::StoreClient`] and the object-source
/// implementations.
///
/// # Fields
/// Each variant carries a `message` with the underlying SDK error rendered
/// via `Display`, consistent with how the rest of this workspace wraps
/// third-party errors (see `s3flow-core::CacheError`, `s3flow-expr::ExprError`).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bucket {bucket:?} does not exist or is unreachable: {message}")]
    BucketUnavailable { bucket: String, message: String },

    #[error("failed to list objects in bucket {bucket:?}: {message}")]
    ListFailed { bucket: String, message: String },

    #[error("failed to download {key:?} from {bucket:?}: {message}")]
    DownloadFailed {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("failed to generate a presigned URL for {key:?} in {bucket:?}: {message}")]
    PresignFailed {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("notification subscription for bucket {bucket:?} failed: {message}")]
    NotificationFailed { bucket: String, message: String },

    #[error("disk I/O error writing {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
