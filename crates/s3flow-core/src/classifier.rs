use std::sync::Arc;

use chrono::Utc;
use s3flow_expr::{DynamicInputFile, EvalContext, ExpressionManager};
use s3flow_store::{Event, EventType, ObjectType};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config_model::{ProductsConfig, PREVIEW_SELECTOR, TARGET_SELECTOR};

/// An event once it carries enough information for its destination
/// (directly the cache for previews, the temporizer for everything else) to
/// act on it.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub event: Event,
    pub group_name: String,
    pub type_name: String,
    pub object_type: ObjectType,
    /// Known immediately for previews (computed via `productBasePath`);
    /// filled in later by the temporizer for siblings.
    pub base_dir: Option<String>,
}

/// Reads raw events and resolves `(imgGroup, imgType, objectType)`,
/// dispatching previews straight to `preview_tx` and everything else to
/// `sibling_tx`. Each event is classified in its own task so a slow
/// expression evaluation never blocks the rest of the stream.
pub struct Classifier {
    products: Arc<ProductsConfig>,
    expr: Arc<ExpressionManager>,
}

impl Classifier {
    pub fn new(products: Arc<ProductsConfig>, expr: Arc<ExpressionManager>) -> Self {
        Self { products, expr }
    }

    pub async fn run(
        &self,
        mut raw_rx: mpsc::Receiver<Event>,
        preview_tx: mpsc::Sender<ClassifiedEvent>,
        sibling_tx: mpsc::Sender<ClassifiedEvent>,
        base_dir_tx: broadcast::Sender<String>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = raw_rx.recv() => {
                    let Some(event) = event else { return };

                    let products = self.products.clone();
                    let expr = self.expr.clone();
                    let preview_tx = preview_tx.clone();
                    let sibling_tx = sibling_tx.clone();
                    let base_dir_tx = base_dir_tx.clone();

                    tokio::spawn(async move {
                        classify_one(event, &products, &expr, &preview_tx, &sibling_tx, &base_dir_tx).await;
                    });
                }
            }
        }
    }
}

async fn classify_one(
    event: Event,
    products: &ProductsConfig,
    expr: &ExpressionManager,
    preview_tx: &mpsc::Sender<ClassifiedEvent>,
    sibling_tx: &mpsc::Sender<ClassifiedEvent>,
    base_dir_tx: &broadcast::Sender<String>,
) {
    let now = Utc::now();

    if event.event_type == EventType::Create {
        if now.signed_duration_since(event.object_last_modified) > products.max_objects_age {
            debug!(key = %event.object_key, "dropping event older than max_objects_age");
            return;
        }
        if now + chrono::Duration::seconds(1) > event.time + products.retention_period {
            debug!(key = %event.object_key, "dropping event past its retention window");
            return;
        }
    }

    let Some((group, ty)) = products.resolve(&event.bucket, &event.object_key) else {
        debug!(bucket = %event.bucket, key = %event.object_key, "no matching image group/type, dropping");
        return;
    };

    let object_type = match &event.object_type {
        Some(known) => known.clone(),
        None => classify_by_selector(ty, &event.object_key),
    };

    if object_type == ObjectType::Preview {
        let base_dir = match eval_base_path(expr, ty, &event) {
            Ok(base_dir) => base_dir,
            Err(err) => {
                warn!(key = %event.object_key, "productBasePath evaluation failed: {}", err);
                return;
            }
        };

        // Announce the base directory before (or racing with) the cache
        // dispatch itself, so the temporizer can release any orphan
        // siblings that arrived first. Broadcast has no subscribers until
        // the temporizer task starts; a send error here just means nobody
        // is listening yet, which is harmless — orphans buffered before
        // that point are swept by the temporizer's own age-out purge.
        let _ = base_dir_tx.send(base_dir.clone());

        let classified = ClassifiedEvent {
            event,
            group_name: group.group_name.clone(),
            type_name: ty.name.clone(),
            object_type,
            base_dir: Some(base_dir),
        };

        let _ = preview_tx.send(classified).await;
        return;
    }

    let classified = ClassifiedEvent {
        event,
        group_name: group.group_name.clone(),
        type_name: ty.name.clone(),
        object_type,
        base_dir: None,
    };

    let _ = sibling_tx.send(classified).await;
}

fn classify_by_selector(ty: &crate::config_model::ImageTypeDef, object_key: &str) -> ObjectType {
    for selector in &ty.file_selectors {
        if selector.regex.is_match(object_key) {
            return match selector.name.as_str() {
                PREVIEW_SELECTOR => ObjectType::Preview,
                TARGET_SELECTOR => ObjectType::Target,
                other => ObjectType::DynamicInput(other.to_string()),
            };
        }
    }
    ObjectType::NotYetAssigned
}

fn eval_base_path(
    expr: &ExpressionManager,
    ty: &crate::config_model::ImageTypeDef,
    event: &Event,
) -> Result<String, s3flow_expr::ExprError> {
    let mut files = std::collections::BTreeMap::new();
    files.insert(
        PREVIEW_SELECTOR.to_string(),
        DynamicInputFile {
            s3_path: event.object_key.clone(),
            cache_key: String::new(),
            date: event.object_last_modified,
        },
    );
    let env = EvalContext::with_prefix(files, ty.expr_prefix());
    let name = ty.expr_name(s3flow_expr::EXPR_PRODUCT_BASE_PATH);
    expr.eval_string(&event.bucket, &event.object_key, &name, &env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_model::{FileSelectorDef, FileSelectorKind, ImageGroupDef, ImageTypeDef};

    fn sample_type() -> ImageTypeDef {
        ImageTypeDef {
            group_name: "G".to_string(),
            name: "T".to_string(),
            display_name: "T".to_string(),
            product_prefix: "p/".to_string(),
            file_selectors: vec![
                FileSelectorDef {
                    name: PREVIEW_SELECTOR.to_string(),
                    regex: regex::Regex::new(r"preview\.jpg$").unwrap(),
                    kind: FileSelectorKind::Cached,
                    link: false,
                },
                FileSelectorDef {
                    name: TARGET_SELECTOR.to_string(),
                    regex: regex::Regex::new(r"target\.json$").unwrap(),
                    kind: FileSelectorKind::Cached,
                    link: false,
                },
            ],
            expressions: vec![],
        }
    }

    #[test]
    fn preview_selector_wins_classification() {
        let ty = sample_type();
        assert_eq!(classify_by_selector(&ty, "p/1/2/preview.jpg"), ObjectType::Preview);
        assert_eq!(classify_by_selector(&ty, "p/1/2/target.json"), ObjectType::Target);
        assert_eq!(classify_by_selector(&ty, "p/1/2/unrelated.bin"), ObjectType::NotYetAssigned);
    }

    #[test]
    fn resolve_picks_first_matching_prefix() {
        let products = ProductsConfig {
            image_groups: vec![ImageGroupDef {
                group_name: "G".to_string(),
                bucket: "b".to_string(),
                types: vec![sample_type()],
            }],
            max_objects_age: chrono::Duration::days(1),
            retention_period: chrono::Duration::days(1),
            full_product_protocol: None,
            full_product_root_url: None,
            target_relative_regexp: None,
        };

        let (group, ty) = products.resolve("b", "p/1/2/preview.jpg").unwrap();
        assert_eq!(group.group_name, "G");
        assert_eq!(ty.name, "T");
        assert!(products.resolve("b", "other/preview.jpg").is_none());
    }
}
