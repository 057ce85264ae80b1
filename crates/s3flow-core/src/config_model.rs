use regex::Regex;

/// How a matched file selector's blob should be materialized.
#[derive(Debug, Clone)]
pub enum FileSelectorKind {
    /// Download the object to disk under the product's cache directory.
    Cached,
    /// Generate a presigned URL and store it instead of downloading.
    SignedUrl,
    /// Like `SignedUrl`, but append extra query parameters produced by
    /// evaluating the named expression.
    FullProductSignedUrl { expr_name: String },
}

/// One entry of an image type's `dynamicData.fileSelectors` map. The
/// selector named `"preview"` is the distinguished preview selector; the
/// selector named `"target"` is the distinguished target selector; every
/// other name produces a dynamic input of that same name.
#[derive(Debug, Clone)]
pub struct FileSelectorDef {
    pub name: String,
    pub regex: Regex,
    pub kind: FileSelectorKind,
    pub link: bool,
}

pub const PREVIEW_SELECTOR: &str = "preview";
pub const TARGET_SELECTOR: &str = "target";

/// A single configured image type within an image group.
#[derive(Debug, Clone)]
pub struct ImageTypeDef {
    /// Denormalized from the enclosing [`ImageGroupDef`] so this type can
    /// compute its own namespaced expression names (see [`Self::expr_name`])
    /// without needing its parent passed around at every call site.
    pub group_name: String,
    pub name: String,
    pub display_name: String,
    pub product_prefix: String,
    /// In declaration order: classification tries selectors in this order,
    /// first match wins, `"preview"` wins ties.
    pub file_selectors: Vec<FileSelectorDef>,
    /// Named expression sources this type makes available to `_call`, plus
    /// the well-known ones (`productBasePath`, `geonames`, …) if present.
    /// Keys are already namespaced via [`qualified_expr_name`] — the
    /// expression manager's program registry is shared process-wide, so two
    /// types both defining a `"productBasePath"` expression must not
    /// collide.
    pub expressions: Vec<(String, String)>,
}

impl ImageTypeDef {
    pub fn preview_selector(&self) -> Option<&FileSelectorDef> {
        self.file_selectors.iter().find(|s| s.name == PREVIEW_SELECTOR)
    }

    pub fn target_selector(&self) -> Option<&FileSelectorDef> {
        self.file_selectors.iter().find(|s| s.name == TARGET_SELECTOR)
    }

    pub fn selector_named(&self, name: &str) -> Option<&FileSelectorDef> {
        self.file_selectors.iter().find(|s| s.name == name)
    }

    /// The name a well-known or user-defined expression of this type is
    /// actually registered under in the (process-wide) expression manager.
    pub fn expr_name(&self, short_name: &str) -> String {
        qualified_expr_name(&self.group_name, &self.name, short_name)
    }

    /// This type's namespace within the expression registry, for binding
    /// into an [`s3flow_expr::EvalContext`] so `_call` with a bare name
    /// resolves this type's own expressions first.
    pub fn expr_prefix(&self) -> String {
        format!("{}::{}", self.group_name, self.name)
    }
}

/// Namespaces an expression's configured name by the image group/type that
/// declared it. The expression manager compiles every type's expressions
/// into one shared program registry keyed by plain name, so two types both
/// defining (say) `"productBasePath"` would otherwise silently clobber each
/// other; this is the config-load-time fix, applied uniformly by whatever
/// builds an [`ImageTypeDef`] and by callers resolving a well-known name back
/// (via [`ImageTypeDef::expr_name`]).
pub fn qualified_expr_name(group_name: &str, type_name: &str, short_name: &str) -> String {
    format!("{group_name}::{type_name}::{short_name}")
}

/// A configured image group: a bucket plus the image types it hosts.
#[derive(Debug, Clone)]
pub struct ImageGroupDef {
    pub group_name: String,
    pub bucket: String,
    pub types: Vec<ImageTypeDef>,
}

/// Deployment-wide product settings the classifier and bucket cache consult.
/// Built by the application layer from parsed configuration; this crate
/// never parses YAML itself.
#[derive(Debug, Clone)]
pub struct ProductsConfig {
    pub image_groups: Vec<ImageGroupDef>,
    pub max_objects_age: chrono::Duration,
    pub retention_period: chrono::Duration,
    /// URL prefix components a `signedURL`/`fullProductSignedURL` selector's
    /// presigned URL is rewritten through before being stored: the scheme and
    /// host of the presigned URL are replaced with these two, unchanged if
    /// neither is configured.
    pub full_product_protocol: Option<String>,
    pub full_product_root_url: Option<String>,
    /// Matched against an orphan sibling's path relative to its base
    /// directory when the temporizer releases it still `NotYetAssigned`.
    /// Falls back to the resolved type's own `target` file selector regex
    /// when not configured.
    pub target_relative_regexp: Option<Regex>,
}

impl ProductsConfig {
    pub fn groups_for_bucket(&self, bucket: &str) -> impl Iterator<Item = &ImageGroupDef> {
        self.image_groups.iter().filter(move |g| g.bucket == bucket)
    }

    /// Resolves `(group, type)` for an object key by matching bucket and
    /// `product_prefix`, returning the first match across all of the
    /// bucket's groups/types in declaration order.
    pub fn resolve(&self, bucket: &str, object_key: &str) -> Option<(&ImageGroupDef, &ImageTypeDef)> {
        for group in self.groups_for_bucket(bucket) {
            for ty in &group.types {
                if object_key.starts_with(&ty.product_prefix) {
                    return Some((group, ty));
                }
            }
        }
        None
    }

    /// Looks up an already-classified event's image type by the names the
    /// classifier attached, without re-matching its prefix regex.
    pub fn type_def(&self, group_name: &str, type_name: &str) -> Option<&ImageTypeDef> {
        self.image_groups
            .iter()
            .find(|g| g.group_name == group_name)?
            .types
            .iter()
            .find(|t| t.name == type_name)
    }
}
