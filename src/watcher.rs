//! Filesystem watch-mode integration: debounces raw `notify` events into
//! per-path change batches and drives single-file reindexing through the
//! pipeline. Grounded on the teacher's `FileWatcherManager` — the
//! debouncer setup, per-file reindex cooldown and stale-entry cleanup are
//! carried over unchanged; only the reindex call target changed (the
//! teacher's `IndexManager::reindex_file` is now
//! `pipeline::index_single_file` against the new vector/FTS stack).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::embedder::EmbeddingClient;
use crate::fts::FtsIndex;
use crate::pipeline::{self, PipelineOptions};
use crate::vectorstore::VectorStore;

/// Minimum interval between re-index operations for the same file (ms).
/// Prevents rapid saves from triggering redundant re-indexing.
const REINDEX_COOLDOWN_MS: u64 = 5000;

pub struct FileWatcherManager {
    watchers: DashMap<String, WatcherHandle>,
    debounce_ms: u64,
}

struct WatcherHandle {
    _watcher: notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>,
}

struct ReindexCooldownTracker {
    last_reindex: HashMap<String, Instant>,
}

impl ReindexCooldownTracker {
    fn new() -> Self {
        Self { last_reindex: HashMap::new() }
    }

    fn should_reindex(&mut self, path: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_reindex.get(path) {
            if now.duration_since(*last) < Duration::from_millis(REINDEX_COOLDOWN_MS) {
                return false;
            }
        }
        self.last_reindex.insert(path.to_string(), now);
        true
    }

    fn cleanup_stale(&mut self) {
        let cutoff = Instant::now() - Duration::from_secs(60);
        self.last_reindex.retain(|_, v| *v > cutoff);
    }
}

/// Everything a watch-mode reindex needs, bundled so the debouncer's
/// closure (which must be `'static`) can hold a single cloned handle.
pub struct WatchTarget {
    pub project_root: PathBuf,
    pub project_id: String,
    pub collection: String,
    pub store: Arc<VectorStore>,
    pub fts: Arc<FtsIndex>,
    pub embedder: Arc<EmbeddingClient>,
    pub options: PipelineOptions,
}

impl FileWatcherManager {
    pub fn new(debounce_ms: u64) -> Self {
        Self { watchers: DashMap::new(), debounce_ms }
    }

    pub fn start_watching(&self, collection_id: &str, target: Arc<WatchTarget>) -> Result<(), notify::Error> {
        if self.watchers.contains_key(collection_id) {
            return Ok(());
        }

        let rt_handle = tokio::runtime::Handle::try_current().ok();
        let cooldown = Arc::new(Mutex::new(ReindexCooldownTracker::new()));
        let cleanup_counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let project_root = target.project_root.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(self.debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let count = cleanup_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if count % 50 == 0 {
                        cooldown.lock().cleanup_stale();
                    }

                    let mut file_events: HashMap<PathBuf, String> = HashMap::new();
                    for event in &events {
                        let change_type = classify_debounced_event(event);
                        if change_type == "access" || change_type == "other" {
                            continue;
                        }
                        for path in &event.paths {
                            if pipeline::is_build_or_output_dir(path) {
                                continue;
                            }
                            file_events.insert(path.clone(), change_type.to_string());
                        }
                    }

                    for (path, _change_type) in file_events {
                        let relative = path.strip_prefix(&project_root).unwrap_or(&path).to_string_lossy().replace('\\', "/");

                        if !cooldown.lock().should_reindex(&relative) {
                            continue;
                        }

                        if let Some(handle) = &rt_handle {
                            let target = target.clone();
                            handle.spawn_blocking(move || {
                                match pipeline::index_single_file(
                                    &target.project_root,
                                    &relative,
                                    &target.project_id,
                                    &target.store,
                                    &target.fts,
                                    &target.embedder,
                                    &target.options,
                                ) {
                                    Ok(chunks) => tracing::debug!(path = %relative, chunks, "watch-mode reindex complete"),
                                    Err(e) => tracing::debug!(path = %relative, error = %e, "watch-mode reindex skipped"),
                                }
                            });
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!("File watcher error: {:?}", e);
                    }
                }
            },
        )?;

        debouncer
            .watch(target.project_root.as_path(), RecursiveMode::Recursive)
            .map_err(|e| notify::Error::generic(&format!("Watch failed: {}", e)))?;

        self.watchers.insert(collection_id.to_string(), WatcherHandle { _watcher: debouncer });
        info!(collection = %collection_id, debounce_ms = self.debounce_ms, "started watching");
        Ok(())
    }

    pub fn stop_watching(&self, collection_id: &str) {
        if self.watchers.remove(collection_id).is_some() {
            info!(collection = %collection_id, "stopped watching");
        }
    }

    pub fn is_watching(&self, collection_id: &str) -> bool {
        self.watchers.contains_key(collection_id)
    }
}

fn classify_debounced_event(event: &DebouncedEvent) -> &'static str {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => "create",
        EventKind::Modify(_) => "modify",
        EventKind::Remove(_) => "remove",
        EventKind::Access(_) => "access",
        _ => "other",
    }
}
