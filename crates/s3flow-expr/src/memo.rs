use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::context::EvalContext;

/// Evaluation results are memoized for this long before a matching digest is
/// no longer trusted and the expression is re-run.
pub const MEMO_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
struct Entry {
    digest: [u8; 32],
    value: rhai::Dynamic,
    stored_at: Instant,
}

/// Caches expression results keyed by `(bucket, s3Key, exprName)`. An entry
/// is valid only if the stored digest of the evaluation's `Files` input
/// still matches and the entry has not aged past [`MEMO_TTL`].
#[derive(Default)]
pub struct MemoCache {
    entries: RwLock<HashMap<(String, String, String), Entry>>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        bucket: &str,
        s3_key: &str,
        expr_name: &str,
        env: &EvalContext,
    ) -> Option<rhai::Dynamic> {
        let key = (bucket.to_string(), s3_key.to_string(), expr_name.to_string());
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&key)?;

        if entry.stored_at.elapsed() >= MEMO_TTL {
            return None;
        }

        if entry.digest != digest_of(env) {
            return None;
        }

        Some(entry.value.clone())
    }

    /// Stores a result. `value` is only memoized when it is a type the digest
    /// check can safely reuse later — dynamic filters that never produce a
    /// stable, re-usable value bypass the memo on the write side.
    pub fn put(&self, bucket: &str, s3_key: &str, expr_name: &str, env: &EvalContext, value: rhai::Dynamic) {
        let key = (bucket.to_string(), s3_key.to_string(), expr_name.to_string());
        let entry = Entry {
            digest: digest_of(env),
            value,
            stored_at: Instant::now(),
        };
        self.entries.write().unwrap().insert(key, entry);
    }
}

fn digest_of(env: &EvalContext) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (selector, s3_path, truncated_ts) in env.digest_input() {
        hasher.update(selector.as_bytes());
        hasher.update(b"\0");
        hasher.update(s3_path.as_bytes());
        hasher.update(b"\0");
        hasher.update(truncated_ts.to_le_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env_with(selector: &str, path: &str) -> EvalContext {
        let mut files = BTreeMap::new();
        files.insert(
            selector.to_string(),
            crate::context::DynamicInputFile {
                s3_path: path.to_string(),
                cache_key: format!("/cache/{path}"),
                date: chrono::Utc::now(),
            },
        );
        EvalContext::new(files)
    }

    #[test]
    fn hit_requires_matching_digest() {
        let cache = MemoCache::new();
        let env = env_with("preview", "p/1/preview.jpg");
        cache.put("b", "p/1/preview.jpg", "productBasePath", &env, rhai::Dynamic::from("p/1"));

        assert!(cache.get("b", "p/1/preview.jpg", "productBasePath", &env).is_some());

        let other_env = env_with("preview", "p/2/preview.jpg");
        assert!(cache
            .get("b", "p/1/preview.jpg", "productBasePath", &other_env)
            .is_none());
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = MemoCache::new();
        let env = env_with("preview", "p/1/preview.jpg");
        assert!(cache.get("b", "p/1/preview.jpg", "productBasePath", &env).is_none());
    }
}
