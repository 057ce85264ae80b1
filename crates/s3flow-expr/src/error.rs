/// Errors surfaced by [`crate::ExpressionManager`] and the built-in
/// primitives it registers.
///
/// # Fields
/// Variants that name a selector or expression carry it verbatim so callers
/// can log which configured name was at fault without re-deriving it from a
/// generic message string.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("expression {name:?} failed to compile: {message}")]
    CompileFailed { name: String, message: String },

    #[error("expression {name:?} is not registered")]
    UnknownExpression { name: String },

    #[error("file selector {selector:?} is not declared for this image type")]
    UnknownSelector { selector: String },

    #[error("expression {name:?} evaluation failed: {message}")]
    EvalFailed { name: String, message: String },

    #[error("expression {name:?} timed out after {seconds}s")]
    Timeout { name: String, seconds: u64 },

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid jq filter {filter:?}: {message}")]
    InvalidJqFilter { filter: String, message: String },

    #[error("failed to parse {path:?} as JSON: {message}")]
    InvalidJson { path: String, message: String },

    #[error("failed to parse {path:?} as XML: {message}")]
    InvalidXml { path: String, message: String },

    #[error("disk I/O error reading {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("expression {name:?} returned a value that could not be decoded as {expected}")]
    DecodeFailed { name: String, expected: String },
}
