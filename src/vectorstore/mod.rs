//! Content-addressed on-disk vector store with an HNSW overlay.
//!
//! Generalizes the teacher's single `usearch::Index`-per-workspace pattern
//! (`embedder.rs::WorkspaceVectorState`) into one handle per collection,
//! backed by a sharded vector-file layout on disk instead of a single
//! opaque index file, with explicit label bookkeeping so soft-delete +
//! re-add preserves external chunk_id identity.

pub mod hnsw;
pub mod manifest;
pub mod storage;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use globset::{Glob, GlobSetBuilder};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use hnsw::HnswOverlay;
use manifest::CollectionManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    Content,
    Metadata,
    Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: PayloadType,
    pub path: String,
    pub language: Option<String>,
    pub line_start: usize,
    pub line_end: usize,
    pub file_hash: String,
    pub project_id: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
    pub file_last_modified: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdIndexEntry {
    pub path: String,
    pub indexed_at: i64,
    pub file_last_modified: i64,
}

pub type IdIndex = HashMap<String, IdIndexEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub payload: Payload,
    pub indexed_at: i64,
    pub file_last_modified: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub hnsw_path: HnswUpdatePath,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HnswUpdatePath {
    #[default]
    None,
    Incremental,
    FullRebuild,
    MarkedStale,
}

#[derive(Default)]
struct SessionState {
    added: HashSet<String>,
    updated: HashSet<String>,
    deleted: HashSet<String>,
}

struct CollectionHandle {
    dir: PathBuf,
    manifest: CollectionManifest,
    id_index: IdIndex,
    hnsw: Option<HnswOverlay>,
}

impl CollectionHandle {
    fn vectors_dir(&self) -> PathBuf {
        self.dir.join("vectors")
    }
    fn payloads_dir(&self) -> PathBuf {
        self.dir.join("payloads")
    }
    fn id_index_path(&self) -> PathBuf {
        self.dir.join("id_index.json")
    }
    fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    fn persist_id_index(&self) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.id_index)?;
        storage::write_atomic(&self.id_index_path(), &bytes)
    }

    fn vector_path(&self, chunk_id: &str) -> PathBuf {
        self.vectors_dir().join(storage::shard_relative_path(chunk_id, "vec.bin"))
    }
    fn payload_path(&self, chunk_id: &str) -> PathBuf {
        self.payloads_dir().join(storage::shard_relative_path(chunk_id, "json"))
    }

    fn load_vector(&self, chunk_id: &str) -> AppResult<Vec<f32>> {
        let bytes = std::fs::read(self.vector_path(chunk_id))?;
        storage::decode_vector_file(&bytes)
    }

    fn load_payload(&self, chunk_id: &str) -> AppResult<Payload> {
        let bytes = std::fs::read(self.payload_path(chunk_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub struct VectorStore {
    collections_root: PathBuf,
    handles: DashMap<String, Arc<RwLock<CollectionHandle>>>,
    sessions: DashMap<String, Arc<parking_lot::Mutex<SessionState>>>,
}

impl VectorStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            collections_root: project_root.into().join(".code-indexer").join("collections"),
            handles: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Opens (creating on first use) the named collection. Returns
    /// `DimensionMismatch` if a manifest already exists with a different
    /// dimension than requested — per spec.md §9, there is no silent
    /// migration.
    pub fn open_collection(
        &self,
        name: &str,
        dimension: usize,
        provider_id: &str,
    ) -> AppResult<()> {
        if self.handles.contains_key(name) {
            return Ok(());
        }
        let dir = self.collections_root.join(name);
        std::fs::create_dir_all(&dir)?;

        let manifest_path = dir.join("manifest.json");
        let manifest = if manifest_path.exists() {
            let bytes = std::fs::read(&manifest_path)?;
            let existing: CollectionManifest = serde_json::from_slice(&bytes)?;
            if existing.dimension != dimension {
                return Err(AppError::DimensionMismatch { expected: existing.dimension, actual: dimension });
            }
            existing
        } else {
            let manifest = CollectionManifest::new(name, dimension, provider_id);
            storage::write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;
            manifest
        };

        let id_index_path = dir.join("id_index.json");
        let id_index: IdIndex = if id_index_path.exists() {
            serde_json::from_slice(&std::fs::read(&id_index_path)?)?
        } else {
            HashMap::new()
        };

        self.handles.insert(
            name.to_string(),
            Arc::new(RwLock::new(CollectionHandle { dir, manifest, id_index, hnsw: None })),
        );
        Ok(())
    }

    fn handle(&self, name: &str) -> AppResult<Arc<RwLock<CollectionHandle>>> {
        self.handles
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| AppError::CollectionNotFound(name.to_string()))
    }

    pub fn dimension(&self, name: &str) -> AppResult<usize> {
        Ok(self.handle(name)?.read().manifest.dimension)
    }

    /// Initializes the per-session change tracker. Idempotent per session;
    /// rejects a second concurrent session with `ConcurrentIndexWrite`.
    pub fn begin_indexing(&self, collection: &str) -> AppResult<()> {
        self.handle(collection)?;
        match self.sessions.entry(collection.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AppError::ConcurrentIndexWrite(collection.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Arc::new(parking_lot::Mutex::new(SessionState::default())));
                Ok(())
            }
        }
    }

    fn session(&self, collection: &str) -> AppResult<Arc<parking_lot::Mutex<SessionState>>> {
        self.sessions
            .get(collection)
            .map(|r| r.clone())
            .ok_or_else(|| AppError::BadRequest(format!("no active indexing session for {collection}")))
    }

    pub fn upsert(&self, collection: &str, points: &[VectorPoint], watch_mode: bool) -> AppResult<()> {
        let handle = self.handle(collection)?;
        let session = self.session(collection)?;
        let now = unix_seconds();

        let mut h = handle.write();
        let dimension = h.manifest.dimension;
        for point in points {
            if point.vector.len() != dimension {
                return Err(AppError::DimensionMismatch { expected: dimension, actual: point.vector.len() });
            }
        }

        for point in points {
            let is_update = h.id_index.contains_key(&point.chunk_id);

            let vector_bytes = storage::encode_vector_file(&point.vector);
            storage::write_atomic(&h.vector_path(&point.chunk_id), &vector_bytes)?;
            let payload_bytes = serde_json::to_vec_pretty(&point.payload)?;
            storage::write_atomic(&h.payload_path(&point.chunk_id), &payload_bytes)?;

            h.id_index.insert(
                point.chunk_id.clone(),
                IdIndexEntry {
                    path: point.payload.path.clone(),
                    indexed_at: now,
                    file_last_modified: point.file_last_modified,
                },
            );

            {
                let mut s = session.lock();
                if is_update {
                    s.updated.insert(point.chunk_id.clone());
                } else {
                    s.added.insert(point.chunk_id.clone());
                }
            }

            if watch_mode {
                if h.hnsw.is_none() {
                    h.hnsw = Some(HnswOverlay::open_or_create(&h.dir, dimension)?);
                }
                if let Some(hnsw) = h.hnsw.as_mut() {
                    hnsw.upsert(&point.chunk_id, &point.vector)?;
                }
            }
        }
        h.persist_id_index()?;
        if watch_mode {
            if let Some(hnsw) = h.hnsw.as_mut() {
                hnsw.persist()?;
            }
        }
        Ok(())
    }

    pub fn delete(&self, collection: &str, chunk_ids: &[String], watch_mode: bool) -> AppResult<()> {
        let handle = self.handle(collection)?;
        let session = self.session(collection)?;

        let mut h = handle.write();
        for chunk_id in chunk_ids {
            if h.id_index.remove(chunk_id).is_some() {
                let _ = std::fs::remove_file(h.vector_path(chunk_id));
                let _ = std::fs::remove_file(h.payload_path(chunk_id));
                session.lock().deleted.insert(chunk_id.clone());

                if watch_mode {
                    if let Some(hnsw) = h.hnsw.as_mut() {
                        hnsw.delete(chunk_id);
                    }
                }
            }
        }
        h.persist_id_index()?;
        if watch_mode {
            if let Some(hnsw) = h.hnsw.as_mut() {
                hnsw.persist()?;
            }
        }
        Ok(())
    }

    /// Applies the auto-detected HNSW maintenance path for the session's
    /// accumulated changes, persists it, and clears the session. See the
    /// operations table in spec.md §4.3 for the decision rule.
    pub fn end_indexing(&self, collection: &str, skip_hnsw: bool) -> AppResult<SessionStats> {
        let handle = self.handle(collection)?;
        let session_arc = self.session(collection)?;
        let (added, updated, deleted) = {
            let s = session_arc.lock();
            (s.added.clone(), s.updated.clone(), s.deleted.clone())
        };
        self.sessions.remove(collection);

        let mut stats =
            SessionStats { added: added.len(), updated: updated.len(), deleted: deleted.len(), hnsw_path: HnswUpdatePath::None };

        let has_changes = !added.is_empty() || !updated.is_empty() || !deleted.is_empty();
        if !has_changes {
            return Ok(stats);
        }

        let mut h = handle.write();
        let dimension = h.manifest.dimension;

        if skip_hnsw {
            if h.hnsw.is_none() && h.dir.join("hnsw_meta.json").exists() {
                h.hnsw = Some(HnswOverlay::open_or_create(&h.dir, dimension)?);
            }
            if let Some(hnsw) = h.hnsw.as_mut() {
                hnsw.mark_stale();
                hnsw.persist()?;
            }
            stats.hnsw_path = HnswUpdatePath::MarkedStale;
            return Ok(stats);
        }

        let needs_full_build = h.hnsw.is_none() && !h.dir.join("hnsw.bin").exists();
        if h.hnsw.is_none() {
            h.hnsw = Some(HnswOverlay::open_or_create(&h.dir, dimension)?);
        }

        if needs_full_build {
            let chunk_ids: Vec<String> = h.id_index.keys().cloned().collect();
            for chunk_id in chunk_ids {
                let vector = h.load_vector(&chunk_id)?;
                h.hnsw.as_mut().unwrap().upsert(&chunk_id, &vector)?;
            }
            stats.hnsw_path = HnswUpdatePath::FullRebuild;
        } else {
            for chunk_id in added.iter().chain(updated.iter()) {
                if let Ok(vector) = h.load_vector(chunk_id) {
                    h.hnsw.as_mut().unwrap().upsert(chunk_id, &vector)?;
                }
            }
            for chunk_id in &deleted {
                h.hnsw.as_mut().unwrap().delete(chunk_id);
            }
            stats.hnsw_path = HnswUpdatePath::Incremental;
        }
        h.hnsw.as_mut().unwrap().persist()?;
        Ok(stats)
    }
}

/// Filter applied post-retrieval to search/scroll results.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    pub must_path_globs: Vec<String>,
    pub must_not_path_globs: Vec<String>,
    pub language: Option<String>,
    pub exclude_language: Option<String>,
}

impl PointFilter {
    fn matches(&self, payload: &Payload) -> AppResult<bool> {
        if let Some(lang) = &self.language {
            if payload.language.as_deref() != Some(lang.as_str()) {
                return Ok(false);
            }
        }
        if let Some(lang) = &self.exclude_language {
            if payload.language.as_deref() == Some(lang.as_str()) {
                return Ok(false);
            }
        }
        if !self.must_not_path_globs.is_empty() && glob_any(&self.must_not_path_globs, &payload.path)? {
            return Ok(false);
        }
        if !self.must_path_globs.is_empty() && !glob_any(&self.must_path_globs, &payload.path)? {
            return Ok(false);
        }
        Ok(true)
    }
}

/// `globset` matches `*/tests/*` literally, so it only matches paths with
/// at least two path separators. Root-relative paths like `tests/foo.py`
/// have a directory segment but no leading separator, so also match a
/// synthetic `/`-prefixed copy of the path — this is what lets a pattern
/// like `*/tests/*` exclude a top-level `tests/` directory as well as a
/// nested one.
fn glob_any(patterns: &[String], path: &str) -> AppResult<bool> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p).map_err(|e| AppError::BadRequest(format!("invalid glob {p}: {e}")))?);
    }
    let set = builder.build().map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(set.is_match(path) || set.is_match(format!("/{path}")))
}

impl VectorStore {
    /// Searches via the HNSW overlay when present and fresh; otherwise
    /// falls back to an exact brute-force scan over the live vector set.
    pub fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        ef_search: usize,
        filter: &PointFilter,
    ) -> AppResult<Vec<SearchHit>> {
        let handle = self.handle(collection)?;
        let mut h = handle.write();
        let dimension = h.manifest.dimension;
        if vector.len() != dimension {
            return Err(AppError::DimensionMismatch { expected: dimension, actual: vector.len() });
        }

        // Over-fetch to compensate for post-retrieval filtering.
        let fetch_k = (k * 4).max(k).min(h.id_index.len().max(1));

        let raw_hits: Vec<(String, f32)> = if h.hnsw.is_some() {
            let stale = h.hnsw.as_ref().unwrap().is_stale();
            if !stale {
                let hnsw = h.hnsw.as_mut().unwrap();
                hnsw.set_ef_search(ef_search);
                hnsw.search(vector, fetch_k)?
            } else {
                self.brute_force_search(&*h, vector, fetch_k)?
            }
        } else {
            self.brute_force_search(&*h, vector, fetch_k)?
        };

        let mut out = Vec::with_capacity(k);
        for (chunk_id, score) in raw_hits {
            let Some(entry) = h.id_index.get(&chunk_id).cloned() else { continue };
            let payload = match h.load_payload(&chunk_id) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if !filter.matches(&payload)? {
                continue;
            }
            out.push(SearchHit {
                chunk_id,
                score,
                payload,
                indexed_at: entry.indexed_at,
                file_last_modified: entry.file_last_modified,
            });
            if out.len() >= k {
                break;
            }
        }
        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    fn brute_force_search(
        &self,
        h: &CollectionHandle,
        vector: &[f32],
        k: usize,
    ) -> AppResult<Vec<(String, f32)>> {
        let mut scored: Vec<(String, f32)> = Vec::with_capacity(h.id_index.len());
        for chunk_id in h.id_index.keys() {
            let Ok(v) = h.load_vector(chunk_id) else { continue };
            let score = cosine_similarity(vector, &v);
            scored.push((chunk_id.clone(), score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Paginated enumeration over the collection's live chunk_ids, for
    /// maintenance operations (prune, compaction).
    pub fn scroll(
        &self,
        collection: &str,
        filter: &PointFilter,
        cursor: Option<String>,
        page_size: usize,
    ) -> AppResult<(Vec<(String, Payload)>, Option<String>)> {
        let handle = self.handle(collection)?;
        let h = handle.read();

        let mut chunk_ids: Vec<&String> = h.id_index.keys().collect();
        chunk_ids.sort();

        let start = match &cursor {
            Some(c) => chunk_ids.partition_point(|id| *id <= c),
            None => 0,
        };

        let mut results = Vec::new();
        let mut next_cursor = None;
        for chunk_id in chunk_ids.into_iter().skip(start) {
            if results.len() >= page_size {
                next_cursor = Some(chunk_id.clone());
                break;
            }
            let Ok(payload) = h.load_payload(chunk_id) else { continue };
            if filter.matches(&payload)? {
                results.push((chunk_id.clone(), payload));
            }
        }
        Ok((results, next_cursor))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_point(chunk_id: &str, vector: Vec<f32>, path: &str) -> VectorPoint {
        VectorPoint {
            chunk_id: chunk_id.to_string(),
            vector,
            payload: Payload {
                payload_type: PayloadType::Content,
                path: path.to_string(),
                language: Some("rust".to_string()),
                line_start: 1,
                line_end: 10,
                file_hash: "abc".to_string(),
                project_id: "proj".to_string(),
                branch: None,
                commit: None,
            },
            file_last_modified: 0,
        }
    }

    #[test]
    fn test_upsert_and_search_roundtrip() {
        let dir = tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        store.open_collection("default", 4, "test-provider").unwrap();
        store.begin_indexing("default").unwrap();
        let point = sample_point("a".repeat(40).as_str(), vec![1.0, 0.0, 0.0, 0.0], "src/a.rs");
        store.upsert("default", &[point.clone()], false).unwrap();
        let stats = store.end_indexing("default", false).unwrap();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.hnsw_path, HnswUpdatePath::FullRebuild);

        let hits = store
            .search("default", &[1.0, 0.0, 0.0, 0.0], 1, 96, &PointFilter::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, point.chunk_id);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_concurrent_index_write_rejected() {
        let dir = tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        store.open_collection("default", 4, "test-provider").unwrap();
        store.begin_indexing("default").unwrap();
        let err = store.begin_indexing("default").unwrap_err();
        assert!(matches!(err, AppError::ConcurrentIndexWrite(_)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        store.open_collection("default", 4, "test-provider").unwrap();
        store.begin_indexing("default").unwrap();
        let point = sample_point("b".repeat(40).as_str(), vec![1.0, 0.0], "src/b.rs");
        let err = store.upsert("default", &[point], false).unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_glob_any_matches_root_level_directory() {
        let patterns = vec!["*/tests/*".to_string()];
        assert!(glob_any(&patterns, "tests/test_db.py").unwrap());
        assert!(glob_any(&patterns, "pkg/tests/test_db.py").unwrap());
        assert!(!glob_any(&patterns, "src/db.py").unwrap());
    }
}
