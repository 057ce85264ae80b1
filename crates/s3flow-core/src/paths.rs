/// Sanitizes an S3-style directory path into a filesystem-safe cache
/// directory name: strip leading/trailing slashes, then replace the
/// remaining ones with `@` so a product's cache directory is a single path
/// segment instead of a nested tree mirroring the bucket layout.
pub fn sanitize(s3_dir: &str) -> String {
    s3_dir.trim_matches('/').replace('/', "@")
}

/// Longest common string prefix of `strs`. Used to compute the narrowest
/// bucket-level prefix a polling or notification source needs to list
/// under, given all of a bucket's configured product prefixes.
pub fn common_prefix<S: AsRef<str>>(strs: &[S]) -> String {
    match strs.len() {
        0 => String::new(),
        1 => strs[0].as_ref().to_string(),
        _ => {
            let first = strs[0].as_ref();
            let max_len = strs.iter().map(|s| s.as_ref().len()).min().unwrap_or(0);
            let mut prefix = String::new();

            for (i, ch) in first.char_indices() {
                if i >= max_len {
                    break;
                }
                let candidate = &first[..i + ch.len_utf8()];
                if strs[1..].iter().all(|s| s.as_ref().starts_with(candidate)) {
                    prefix = candidate.to_string();
                } else {
                    break;
                }
            }

            prefix
        }
    }
}

/// The parent "directory" of an S3 object key, as a string (S3 keys have no
/// real filesystem semantics, just `/`-delimited segments).
pub fn dirname(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    }
}

pub fn is_prefix_of_dir(prefix: &str, dir: &str) -> bool {
    dir == prefix || dir.starts_with(&format!("{prefix}/"))
}

/// The object key's path relative to its product's base directory, with any
/// leading slash trimmed. Falls back to the full key if it doesn't actually
/// live under `base_dir` (shouldn't happen once classification/temporizing
/// has run, but callers should not panic on it).
pub fn relative_to_base<'a>(base_dir: &str, object_key: &'a str) -> &'a str {
    object_key
        .strip_prefix(base_dir)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(object_key)
}

/// On-disk directory a product's cache files live under:
/// `<cache_root>/<bucket>/<sanitize(base_dir)>`.
pub fn record_dir(cache_root: &std::path::Path, bucket: &str, base_dir: &str) -> std::path::PathBuf {
    cache_root.join(bucket).join(sanitize(base_dir))
}

/// Path-traversal check for keys read back out of the cache via
/// `GetCachedObject`: rejects anything containing a `..` component or an
/// absolute path, matching the Design Notes' "the core should reject too".
pub fn is_safe_cache_relative_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return false;
    }
    !p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sanitize_trims_and_replaces_slashes() {
        assert_eq!(sanitize("/p/1/2/"), "p@1@2");
        assert_eq!(sanitize("p/1/2"), "p@1@2");
        assert_eq!(sanitize("p"), "p");
    }

    #[test]
    fn common_prefix_of_siblings() {
        assert_eq!(common_prefix(&["previews/a", "previews/b"]), "previews/");
        assert_eq!(common_prefix(&["p/1/2/preview.jpg"]), "p/1/2/preview.jpg");
        assert_eq!(common_prefix::<&str>(&[]), "");
    }

    #[test]
    fn is_prefix_of_dir_matches_exact_and_nested() {
        assert!(is_prefix_of_dir("p/1/2", "p/1/2"));
        assert!(is_prefix_of_dir("p/1/2", "p/1/2/sub"));
        assert!(!is_prefix_of_dir("p/1/2", "p/1/20"));
    }

    #[test]
    fn rejects_path_traversal_and_absolute_paths() {
        assert!(is_safe_cache_relative_path("preview.jpg"));
        assert!(is_safe_cache_relative_path("__targets__/a.json"));
        assert!(!is_safe_cache_relative_path("../secret"));
        assert!(!is_safe_cache_relative_path("a/../../secret"));
        assert!(!is_safe_cache_relative_path("/etc/passwd"));
        assert!(!is_safe_cache_relative_path(""));
    }

    #[test]
    fn relative_to_base_trims_the_product_prefix() {
        assert_eq!(relative_to_base("p/1/2", "p/1/2/target.json"), "target.json");
        assert_eq!(relative_to_base("p/1/2", "p/1/2/sub/target.json"), "sub/target.json");
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(s in "[a-zA-Z0-9/]{0,32}") {
            let once = sanitize(&s);
            let twice = sanitize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn common_prefix_is_associative_over_three(a in "[a-z]{1,8}", b in "[a-z]{1,8}", c in "[a-z]{1,8}") {
            let direct = common_prefix(&[a.as_str(), b.as_str(), c.as_str()]);
            let folded = common_prefix(&[common_prefix(&[a.as_str(), b.as_str()]), c.clone()]);
            prop_assert_eq!(direct, folded);
        }
    }
}
