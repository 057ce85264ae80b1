use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use s3flow_store::ObjectType;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::classifier::ClassifiedEvent;
use crate::config_model::ProductsConfig;
use crate::paths::{dirname, is_prefix_of_dir, relative_to_base};

/// How often buffered orphans are swept for expiry.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Maximum time an orphan sibling waits for its preview before being
/// dropped.
pub const MAX_LIFETIME: Duration = Duration::from_secs(10 * 60);

struct Buffered {
    event: ClassifiedEvent,
    appended_at: Instant,
}

/// Buffers sibling events (targets, dynamic inputs) that arrive before their
/// product's base directory is known, releasing them once the classifier
/// announces that base directory. A single task owns all buffered state —
/// no locking needed since it is the sole reader and writer.
pub struct Temporizer {
    products: Arc<ProductsConfig>,
    unassigned: HashMap<String, Vec<Buffered>>,
}

impl Temporizer {
    pub fn new(products: Arc<ProductsConfig>) -> Self {
        Self {
            products,
            unassigned: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut sibling_rx: mpsc::Receiver<ClassifiedEvent>,
        mut base_dir_rx: broadcast::Receiver<String>,
        release_tx: mpsc::Sender<ClassifiedEvent>,
        cancel: CancellationToken,
    ) {
        let mut purge_ticker = tokio::time::interval(PURGE_INTERVAL);
        let mut known_base_dirs: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = sibling_rx.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(event, &known_base_dirs, &release_tx).await;
                }
                base_dir = base_dir_rx.recv() => {
                    if let Ok(base_dir) = base_dir {
                        known_base_dirs.push(base_dir.clone());
                        self.release(&base_dir, &release_tx).await;
                    }
                }
                _ = purge_ticker.tick() => {
                    self.purge();
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: ClassifiedEvent,
        known_base_dirs: &[String],
        release_tx: &mpsc::Sender<ClassifiedEvent>,
    ) {
        let obj_dir = dirname(&event.event.object_key);

        if let Some(base_dir) = known_base_dirs.iter().find(|b| is_prefix_of_dir(b, obj_dir)) {
            if let Some(event) = self.reclassify_if_needed(event, base_dir) {
                let _ = release_tx.send(event).await;
            }
            return;
        }

        trace!(dir = obj_dir, "buffering orphan sibling");
        self.unassigned.entry(obj_dir.to_string()).or_default().push(Buffered {
            event,
            appended_at: Instant::now(),
        });
    }

    async fn release(&mut self, base_dir: &str, release_tx: &mpsc::Sender<ClassifiedEvent>) {
        let matching_dirs: Vec<String> = self
            .unassigned
            .keys()
            .filter(|dir| is_prefix_of_dir(base_dir, dir))
            .cloned()
            .collect();

        for dir in matching_dirs {
            let Some(buffered) = self.unassigned.remove(&dir) else { continue };
            debug!(dir, base_dir, released = buffered.len(), "releasing buffered siblings");

            for entry in buffered {
                if let Some(event) = self.reclassify_if_needed(entry.event, base_dir) {
                    let _ = release_tx.send(event).await;
                }
            }
        }
    }

    /// An event released while still `NotYetAssigned` is matched against a
    /// target regex relative to `base_dir`; non-matches are dropped rather
    /// than forwarded with an unresolved object type. `products.targetRelativeRegexp`
    /// is tried first when configured, falling back to the resolved type's
    /// own `target` file selector regex.
    fn reclassify_if_needed(&self, mut event: ClassifiedEvent, base_dir: &str) -> Option<ClassifiedEvent> {
        event.base_dir = Some(base_dir.to_string());

        if event.object_type != ObjectType::NotYetAssigned {
            return Some(event);
        }

        let relative = relative_to_base(base_dir, &event.event.object_key);

        let matches = if let Some(global) = &self.products.target_relative_regexp {
            global.is_match(relative)
        } else {
            let ty = self.products.type_def(&event.group_name, &event.type_name)?;
            let target = ty.target_selector()?;
            target.regex.is_match(relative)
        };

        if matches {
            event.object_type = ObjectType::Target;
            Some(event)
        } else {
            None
        }
    }

    fn purge(&mut self) {
        let now = Instant::now();
        let before = self.unassigned.len();

        self.unassigned.retain(|_, entries| {
            entries.retain(|e| now.duration_since(e.appended_at) < MAX_LIFETIME);
            !entries.is_empty()
        });

        let dropped = before.saturating_sub(self.unassigned.len());
        if dropped > 0 {
            debug!(dropped, "purged expired orphan directories");
        }
    }
}
