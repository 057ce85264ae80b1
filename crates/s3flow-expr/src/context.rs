use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A single named input available to an expression evaluation: the object's
/// original S3 key, its path in the local cache (if materialized), and the
/// timestamp the selector last observed it at.
#[derive(Debug, Clone)]
pub struct DynamicInputFile {
    pub s3_path: String,
    pub cache_key: String,
    pub date: DateTime<Utc>,
}

/// The environment a single expression evaluation runs against: the
/// selector-name → file mapping visible to that product at the moment of
/// evaluation. Held only for the duration of one `eval` call — the manager
/// that owns the compiled programs is responsible for resolving `_call`
/// against its own registry, so this struct carries no back-reference to it.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub files: BTreeMap<String, DynamicInputFile>,
    /// The namespace `_call` qualifies a bare expression name with before
    /// falling back to a global lookup — set to the declaring image type's
    /// `group::type` prefix so `_call("helper")` reaches that type's own
    /// `helper` expression rather than some other type's, while an
    /// unqualified global name (e.g. a `dynamicFilters` entry) still
    /// resolves via the fallback.
    pub expr_prefix: Option<String>,
}

impl EvalContext {
    pub fn new(files: BTreeMap<String, DynamicInputFile>) -> Self {
        Self { files, expr_prefix: None }
    }

    pub fn with_prefix(files: BTreeMap<String, DynamicInputFile>, expr_prefix: impl Into<String>) -> Self {
        Self { files, expr_prefix: Some(expr_prefix.into()) }
    }

    pub fn file(&self, selector: &str) -> Option<&DynamicInputFile> {
        self.files.get(selector)
    }

    /// Digest used as the memoization key's validity check: a selector's
    /// presence, s3 path and truncated timestamp all have to match for a
    /// memo entry to still apply.
    pub(crate) fn digest_input(&self) -> Vec<(String, String, i64)> {
        self.files
            .iter()
            .map(|(name, file)| (name.clone(), file.s3_path.clone(), file.date.timestamp()))
            .collect()
    }
}
