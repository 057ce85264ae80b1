//! Loads, validates, and converts the YAML configuration document into the
//! runtime shapes `s3flow-core` and `s3flow-expr` operate on: a thin raw
//! deserialization pass, then a `validate` pass that turns structural
//! problems into a typed [`ConfigError`], then a `build_runtime` pass that
//! compiles expressions and constructs the types the wiring layer needs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use regex::Regex;
use s3flow_core::{FileSelectorDef, FileSelectorKind, ImageGroupDef, ImageTypeDef, ProductsConfig};
use s3flow_expr::{ExpressionManager, ExpressionManagerConfig};
use serde::Deserialize;

/// Errors raised while loading or validating a configuration document.
/// Splits "couldn't even parse it" from "parsed, but it doesn't make sense".
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?} as YAML: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

type ConfigResult<T> = Result<T, ConfigError>;

fn default_polling_mode() -> bool {
    true
}

fn default_polling_period() -> StdDuration {
    StdDuration::from_secs(30)
}

fn default_use_ssl() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    s3: RawS3Config,
    #[serde(default)]
    ui: RawUiConfig,
    products: RawProductsConfig,
    cache: RawCacheConfig,
    #[serde(default)]
    log: RawLogConfig,
    #[serde(default)]
    monitoring: RawMonitoringConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawS3Config {
    #[serde(default = "default_polling_mode")]
    polling_mode: bool,
    #[serde(default = "default_polling_period", with = "humantime_serde")]
    polling_period: StdDuration,
    endpoint: String,
    access_id: String,
    access_secret: String,
    #[serde(default = "default_use_ssl")]
    use_ssl: bool,
}

/// Parsed but not consumed by the ingestion core — kept so a config file
/// written for the full deployment (including its out-of-scope HTTP/UI
/// surface) still validates here.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUiConfig {
    #[serde(default)]
    web_server_port: Option<u16>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    window_title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDynamicData {
    #[serde(default)]
    file_selectors: BTreeMap<String, RawFileSelector>,
    #[serde(default)]
    expressions: BTreeMap<String, String>,
}

impl RawDynamicData {
    /// Child-wins merge: entries in `child` replace same-named entries
    /// inherited from `self`.
    fn merged_with(&self, child: &RawDynamicData) -> RawDynamicData {
        let mut file_selectors = self.file_selectors.clone();
        file_selectors.extend(child.file_selectors.clone());
        let mut expressions = self.expressions.clone();
        expressions.extend(child.expressions.clone());
        RawDynamicData { file_selectors, expressions }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFileSelector {
    regex: String,
    kind: String,
    #[serde(default)]
    link: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDynamicFilter {
    name: String,
    expression: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImageType {
    name: String,
    display_name: String,
    product_prefix: String,
    #[serde(default)]
    dynamic_data: RawDynamicData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImageGroup {
    group_name: String,
    bucket: String,
    #[serde(default)]
    dynamic_data: RawDynamicData,
    types: Vec<RawImageType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProductsConfig {
    #[serde(default)]
    target_relative_regexp: Option<String>,
    #[serde(default)]
    full_product_protocol: Option<String>,
    #[serde(default)]
    full_product_root_url: Option<String>,
    #[serde(with = "humantime_serde")]
    max_objects_age: StdDuration,
    #[serde(default)]
    dynamic_data: RawDynamicData,
    #[serde(default)]
    dynamic_filters: Vec<RawDynamicFilter>,
    image_groups: Vec<RawImageGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCacheConfig {
    cache_dir: String,
    #[serde(with = "humantime_serde")]
    retention_period: StdDuration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    json_log_format: bool,
}

impl Default for RawLogConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), json_log_format: false }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMonitoringConfig {
    #[serde(default)]
    prometheus_instance_label: Option<String>,
}

/// S3 origin-store connection settings, validated and ready for
/// `s3flow_store::StoreClient::from_endpoint`.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub polling_mode: bool,
    pub polling_period: StdDuration,
    pub endpoint: String,
    pub access_id: String,
    pub access_secret: String,
    pub use_ssl: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Already has the `s3_image_server` suffix appended.
    pub cache_dir: std::path::PathBuf,
    pub retention_period: StdDuration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_level: String,
    pub json_log_format: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MonitoringConfig {
    pub prometheus_instance_label: Option<String>,
}

/// A loaded, validated configuration document. Call [`Config::build_runtime`]
/// to compile its expressions and produce the types `s3flow-core` consumes.
#[derive(Debug)]
pub struct Config {
    pub s3: S3Config,
    pub cache: CacheConfig,
    pub log: LogConfig,
    pub monitoring: MonitoringConfig,
    raw_products: RawProductsConfig,
}

impl Config {
    pub fn load(path: &Path) -> ConfigResult<Config> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let config = Config::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> ConfigResult<Config> {
        let mut cache_dir = std::path::PathBuf::from(&raw.cache.cache_dir);
        if !cache_dir.is_absolute() {
            return Err(ConfigError::Validation(format!("cache.cacheDir {:?} must be an absolute path", raw.cache.cache_dir)));
        }
        cache_dir.push("s3_image_server");

        let endpoint = raw.s3.endpoint.trim_start_matches("https://").trim_start_matches("http://").to_string();

        Ok(Config {
            s3: S3Config {
                polling_mode: raw.s3.polling_mode,
                polling_period: raw.s3.polling_period,
                endpoint,
                access_id: raw.s3.access_id,
                access_secret: raw.s3.access_secret,
                use_ssl: raw.s3.use_ssl,
            },
            cache: CacheConfig { cache_dir, retention_period: raw.cache.retention_period },
            log: LogConfig { log_level: raw.log.log_level, json_log_format: raw.log.json_log_format },
            monitoring: MonitoringConfig { prometheus_instance_label: raw.monitoring.prometheus_instance_label },
            raw_products: raw.products,
        })
    }

    /// Structural validation: duplicate names, invalid regex, unknown
    /// selector kinds, a `fullProductSignedURL(expr)` referencing an
    /// expression the type never defines. A well-known object type with no
    /// file selector at any level is a warning, not a failure.
    pub fn validate(&self) -> ConfigResult<()> {
        let products = &self.raw_products;

        if let Some(pattern) = &products.target_relative_regexp {
            if let Err(err) = Regex::new(pattern) {
                return Err(ConfigError::Validation(format!("invalid products.targetRelativeRegexp: {err}")));
            }
        }

        let mut filter_names = std::collections::HashSet::new();
        for filter in &products.dynamic_filters {
            if filter.name.is_empty() {
                return Err(ConfigError::Validation("products.dynamicFilters entries must have a non-empty name".to_string()));
            }
            if !filter_names.insert(filter.name.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate dynamic filter name {:?}", filter.name)));
            }
        }

        let mut group_names = std::collections::HashSet::new();
        for group in &products.image_groups {
            if !group_names.insert(group.group_name.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate image group name {:?}", group.group_name)));
            }

            let merged_group_defaults = products.dynamic_data.merged_with(&group.dynamic_data);

            let mut type_names = std::collections::HashSet::new();
            for ty in &group.types {
                if !type_names.insert(ty.name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "duplicate image type name {:?} in group {:?}",
                        ty.name, group.group_name
                    )));
                }

                let merged = merged_group_defaults.merged_with(&ty.dynamic_data);

                let mut selector_names = std::collections::HashSet::new();
                for (name, selector) in &merged.file_selectors {
                    if !selector_names.insert(name.as_str()) {
                        return Err(ConfigError::Validation(format!("duplicate file selector name {name:?}")));
                    }
                    if let Err(err) = Regex::new(&selector.regex) {
                        return Err(ConfigError::Validation(format!("invalid regex for selector {name:?}: {err}")));
                    }
                    let kind = parse_selector_kind(&selector.kind)?;
                    if let FileSelectorKind::FullProductSignedUrl { expr_name } = &kind {
                        if !merged.expressions.contains_key(expr_name) {
                            return Err(ConfigError::Validation(format!(
                                "fullProductSignedURL({expr_name:?}) on selector {name:?} references an expression {:?} does not define",
                                ty.name
                            )));
                        }
                    }
                }

                if !merged.file_selectors.contains_key(s3flow_core::PREVIEW_SELECTOR) {
                    tracing::warn!(group = %group.group_name, r#type = %ty.name, "image type has no preview file selector");
                }
                if !merged.file_selectors.contains_key(s3flow_core::TARGET_SELECTOR) {
                    tracing::warn!(group = %group.group_name, r#type = %ty.name, "image type has no target file selector");
                }
            }
        }

        Ok(())
    }

    /// Compiles every configured expression and builds the runtime
    /// `ProductsConfig`/`ExpressionManager` pair the wiring layer hands to
    /// `GlobalCache`/`Classifier`/`Temporizer`.
    pub fn build_runtime(&self) -> ConfigResult<(Arc<ProductsConfig>, Arc<ExpressionManager>)> {
        let expr = Arc::new(ExpressionManager::new(ExpressionManagerConfig::default()));
        let products = &self.raw_products;

        // Global, bucket-agnostic expressions referenced by bare name via
        // `_call` (e.g. a shared helper several image types invoke).
        for filter in &products.dynamic_filters {
            expr.compile(&filter.name, &filter.expression)
                .map_err(|err| ConfigError::Validation(format!("failed to compile dynamic filter {:?}: {err}", filter.name)))?;
        }

        let mut image_groups = Vec::new();
        for group in &products.image_groups {
            let merged_group_defaults = products.dynamic_data.merged_with(&group.dynamic_data);

            let mut types = Vec::new();
            for raw_ty in &group.types {
                let merged = merged_group_defaults.merged_with(&raw_ty.dynamic_data);

                let mut file_selectors = Vec::new();
                for (name, selector) in &merged.file_selectors {
                    let kind = parse_selector_kind_qualified(&selector.kind, &group.group_name, &raw_ty.name)?;
                    file_selectors.push(FileSelectorDef {
                        name: name.clone(),
                        regex: Regex::new(&selector.regex)
                            .map_err(|err| ConfigError::Validation(format!("invalid regex for selector {name:?}: {err}")))?,
                        kind,
                        link: selector.link,
                    });
                }
                // `BTreeMap` iteration puts selectors in alphabetical order,
                // which does not generally place `preview` first; classification
                // (spec.md 4.2) requires the preview selector to win ties against
                // any other selector matching at the same position, so it must be
                // tried first regardless of name order.
                file_selectors.sort_by_key(|s| (s.name != s3flow_core::PREVIEW_SELECTOR, s.name.clone()));

                let mut expressions = Vec::new();
                for (short_name, source) in &merged.expressions {
                    let qualified = s3flow_core::qualified_expr_name(&group.group_name, &raw_ty.name, short_name);
                    expr.compile(&qualified, source).map_err(|err| {
                        ConfigError::Validation(format!(
                            "failed to compile expression {short_name:?} for {}/{}: {err}",
                            group.group_name, raw_ty.name
                        ))
                    })?;
                    expressions.push((qualified, source.clone()));
                }

                types.push(ImageTypeDef {
                    group_name: group.group_name.clone(),
                    name: raw_ty.name.clone(),
                    display_name: raw_ty.display_name.clone(),
                    product_prefix: raw_ty.product_prefix.clone(),
                    file_selectors,
                    expressions,
                });
            }

            image_groups.push(ImageGroupDef {
                group_name: group.group_name.clone(),
                bucket: group.bucket.clone(),
                types,
            });
        }

        let max_objects_age = ChronoDuration::from_std(products.max_objects_age)
            .map_err(|err| ConfigError::Validation(format!("products.maxObjectsAge out of range: {err}")))?;
        let retention_period = ChronoDuration::from_std(self.cache.retention_period)
            .map_err(|err| ConfigError::Validation(format!("cache.retentionPeriod out of range: {err}")))?;

        let target_relative_regexp = products
            .target_relative_regexp
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| ConfigError::Validation(format!("invalid products.targetRelativeRegexp: {err}")))?;

        let products_config = Arc::new(ProductsConfig {
            image_groups,
            max_objects_age,
            retention_period,
            full_product_protocol: products.full_product_protocol.clone(),
            full_product_root_url: products.full_product_root_url.clone(),
            target_relative_regexp,
        });
        Ok((products_config, expr))
    }

    /// The set of buckets configured across all image groups, in the order
    /// they are first declared — the wiring layer spawns one object source
    /// per bucket from this.
    pub fn configured_buckets(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        for group in &self.raw_products.image_groups {
            seen.insert(group.bucket.clone());
        }
        seen.into_iter().collect()
    }
}

/// A minimal, valid configuration document covering every required section
/// and one of each recognized `fileSelectors.kind`, printed by
/// `--dump-config` when it's run without `-c` so an operator has something
/// to copy from. Mirrors the role of the original's embedded
/// `resources/sample-config.yml`, reprinted on usage error.
pub const SAMPLE_CONFIG: &str = r#"s3:
  pollingMode: true
  pollingPeriod: 30s
  endpoint: s3.example.com:9000
  accessID: CHANGE_ME
  accessSecret: CHANGE_ME
  useSSL: true

products:
  maxObjectsAge: 168h
  dynamicData:
    fileSelectors:
      preview:
        regex: 'preview\.jpg$'
        kind: cached
      target:
        regex: 'target\.json$'
        kind: cached
      thumbnail:
        regex: 'thumb\.jpg$'
        kind: signedURL
    expressions:
      productBasePath: '_replaceRegex(_s3Key("preview"), "/preview\\.jpg$", "")'
  imageGroups:
    - groupName: satellite
      bucket: previews
      types:
        - name: optical
          displayName: Optical imagery
          productPrefix: optical/

cache:
  cacheDir: /var/cache
  retentionPeriod: 24h

log:
  logLevel: info
  jsonLogFormat: false
"#;

fn parse_selector_kind(kind: &str) -> ConfigResult<FileSelectorKind> {
    parse_selector_kind_inner(kind, None)
}

fn parse_selector_kind_qualified(kind: &str, group_name: &str, type_name: &str) -> ConfigResult<FileSelectorKind> {
    parse_selector_kind_inner(kind, Some((group_name, type_name)))
}

/// Parses a `dynamicData.fileSelectors.<name>.kind` value: `cached`,
/// `signedURL`, or `fullProductSignedURL(exprName)`. When `qualify` is set,
/// the captured `exprName` is namespaced to the owning image type so it
/// matches how that type's expressions were registered — see
/// [`s3flow_core::qualified_expr_name`].
fn parse_selector_kind_inner(kind: &str, qualify: Option<(&str, &str)>) -> ConfigResult<FileSelectorKind> {
    static FULL_PRODUCT_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^fullProductSignedURL\(([^)]+)\)$").unwrap());

    match kind {
        "cached" => Ok(FileSelectorKind::Cached),
        "signedURL" => Ok(FileSelectorKind::SignedUrl),
        other => {
            let Some(captures) = FULL_PRODUCT_RE.captures(other) else {
                return Err(ConfigError::Validation(format!("unknown file selector kind {other:?}")));
            };
            let expr_name = captures[1].to_string();
            let expr_name = match qualify {
                Some((group_name, type_name)) => s3flow_core::qualified_expr_name(group_name, type_name, &expr_name),
                None => expr_name,
            };
            Ok(FileSelectorKind::FullProductSignedUrl { expr_name })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &std::path::Path, yaml: &str) -> std::path::PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    fn minimal_yaml(cache_dir: &str) -> String {
        format!(
            r#"
s3:
  endpoint: "https://s3.example.test"
  accessID: "id"
  accessSecret: "secret"
products:
  maxObjectsAge: "24h"
  imageGroups:
    - groupName: "photos"
      bucket: "b"
      types:
        - name: "t"
          displayName: "T"
          productPrefix: "p/"
          dynamicData:
            fileSelectors:
              preview:
                regex: "preview\\.jpg$"
                kind: "cached"
              target:
                regex: "target\\.json$"
                kind: "cached"
cache:
  cacheDir: "{cache_dir}"
  retentionPeriod: "72h"
"#
        )
    }

    #[test]
    fn loads_a_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let path = write_config(dir.path(), &minimal_yaml(&cache_dir.display().to_string()));

        let config = Config::load(&path).unwrap();
        assert_eq!(config.s3.endpoint, "s3.example.test");
        assert!(config.cache.cache_dir.ends_with("s3_image_server"));
        assert_eq!(config.configured_buckets(), vec!["b".to_string()]);
    }

    #[test]
    fn rejects_a_relative_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &minimal_yaml("relative/cache"));
        assert!(matches!(Config::load(&path), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_image_group_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        // Append a second image group sharing the first one's name, as a
        // sibling list item right before the top-level `cache:` section.
        let yaml = minimal_yaml(&cache_dir.display().to_string()).replacen(
            "cache:\n",
            "    - groupName: \"photos\"\n      bucket: \"b2\"\n      types: []\ncache:\n",
            1,
        );
        let path = write_config(dir.path(), &yaml);
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(message) if message.contains("duplicate image group name")));
    }

    #[test]
    fn rejects_unknown_selector_kind() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let yaml = minimal_yaml(&cache_dir.display().to_string()).replace("kind: \"cached\"\n              target:", "kind: \"bogus\"\n              target:");
        let path = write_config(dir.path(), &yaml);
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(message) if message.contains("unknown file selector kind")));
    }

    #[test]
    fn full_product_signed_url_requires_a_defined_expression() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let yaml = minimal_yaml(&cache_dir.display().to_string()).replace(
            "target:\n                regex: \"target\\\\.json$\"\n                kind: \"cached\"",
            "target:\n                regex: \"target\\\\.json$\"\n                kind: \"fullProductSignedURL(missingExpr)\"",
        );
        let path = write_config(dir.path(), &yaml);
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(message) if message.contains("fullProductSignedURL")));
    }

    #[test]
    fn build_runtime_qualifies_well_known_expression_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let yaml = minimal_yaml(&cache_dir.display().to_string()).replace(
            "dynamicData:\n            fileSelectors:",
            "dynamicData:\n            expressions:\n              productBasePath: \"_s3Key(\\\"preview\\\")\"\n            fileSelectors:",
        );
        let path = write_config(dir.path(), &yaml);
        let config = Config::load(&path).unwrap();
        let (products, expr) = config.build_runtime().unwrap();
        let ty = products.type_def("photos", "t").unwrap();
        assert!(expr.is_registered(&ty.expr_name(s3flow_expr::EXPR_PRODUCT_BASE_PATH)));
    }
}
