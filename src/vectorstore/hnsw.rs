use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::error::{AppError, AppResult};

const INITIAL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HnswMeta {
    /// Serialized as string keys since JSON object keys must be strings.
    pub label_to_id: HashMap<String, String>,
    pub id_to_label: HashMap<String, u64>,
    pub next_label: u64,
    pub vector_count: usize,
    pub is_stale: bool,
}

/// HNSW overlay over the content-addressed vector store: a `usearch::Index`
/// plus explicit label<->chunk_id bookkeeping so soft-delete + re-add keeps
/// external chunk_id identity stable (usearch itself has no concept of
/// "the same external id across an update", only opaque u64 labels).
pub struct HnswOverlay {
    index_path: PathBuf,
    meta_path: PathBuf,
    index: usearch::Index,
    meta: HnswMeta,
    dimension: usize,
    ef_search: usize,
}

impl HnswOverlay {
    pub fn open_or_create(dir: &Path, dimension: usize) -> AppResult<Self> {
        let index_path = dir.join("hnsw.bin");
        let meta_path = dir.join("hnsw_meta.json");

        let options = IndexOptions {
            dimensions: dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F16,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 96,
            multi: false,
        };
        let index = usearch::Index::new(&options)
            .map_err(|e| AppError::IndexError(format!("failed to create HNSW index: {e}")))?;

        let meta = if index_path.exists() && meta_path.exists() {
            match index.load(index_path.to_string_lossy().as_ref()) {
                Ok(()) => {
                    let bytes = std::fs::read(&meta_path)?;
                    serde_json::from_slice(&bytes).unwrap_or_default()
                }
                Err(e) => {
                    tracing::warn!("HNSW index at {:?} failed to load ({e}); starting empty", index_path);
                    index
                        .reserve(INITIAL_CAPACITY)
                        .map_err(|e| AppError::IndexError(e.to_string()))?;
                    HnswMeta::default()
                }
            }
        } else {
            index
                .reserve(INITIAL_CAPACITY)
                .map_err(|e| AppError::IndexError(e.to_string()))?;
            HnswMeta::default()
        };

        Ok(Self { index_path, meta_path, index, meta, dimension, ef_search: 96 })
    }

    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.ef_search = ef_search;
    }

    pub fn is_stale(&self) -> bool {
        self.meta.is_stale
    }

    pub fn mark_stale(&mut self) {
        self.meta.is_stale = true;
    }

    pub fn vector_count(&self) -> usize {
        self.meta.vector_count
    }

    fn ensure_capacity(&self) -> AppResult<()> {
        let needed = self.meta.vector_count + 1024;
        if needed > self.index.capacity() {
            self.index
                .reserve(needed.max(INITIAL_CAPACITY))
                .map_err(|e| AppError::IndexError(e.to_string()))?;
        }
        Ok(())
    }

    /// Soft-delete + re-add: if `chunk_id` already has a label, its old
    /// vector is removed from the graph and the *same* label re-added with
    /// the new vector, so external callers never see chunk_id identity
    /// move. Otherwise a fresh monotonically-increasing label is minted.
    pub fn upsert(&mut self, chunk_id: &str, vector: &[f32]) -> AppResult<()> {
        if vector.len() != self.dimension {
            return Err(AppError::DimensionMismatch { expected: self.dimension, actual: vector.len() });
        }
        self.ensure_capacity()?;

        if let Some(&label) = self.meta.id_to_label.get(chunk_id) {
            let _ = self.index.remove(label);
            self.index
                .add(label, vector)
                .map_err(|e| AppError::IndexError(format!("HNSW re-add failed: {e}")))?;
        } else {
            let label = self.meta.next_label;
            self.meta.next_label += 1;
            self.index
                .add(label, vector)
                .map_err(|e| AppError::IndexError(format!("HNSW add failed: {e}")))?;
            self.meta.id_to_label.insert(chunk_id.to_string(), label);
            self.meta.label_to_id.insert(label.to_string(), chunk_id.to_string());
            self.meta.vector_count += 1;
        }
        Ok(())
    }

    pub fn delete(&mut self, chunk_id: &str) {
        if let Some(label) = self.meta.id_to_label.remove(chunk_id) {
            self.meta.label_to_id.remove(&label.to_string());
            let _ = self.index.remove(label);
            self.meta.vector_count = self.meta.vector_count.saturating_sub(1);
        }
    }

    /// Searches and returns `(chunk_id, score)` pairs sorted by descending
    /// cosine similarity, with any label no longer present in the live
    /// `label_to_id` map defensively filtered out (invariant 3).
    pub fn search(&self, vector: &[f32], k: usize) -> AppResult<Vec<(String, f32)>> {
        if vector.len() != self.dimension {
            return Err(AppError::DimensionMismatch { expected: self.dimension, actual: vector.len() });
        }
        // `accuracy` maps to ef_search (expansion_search); applied per-query
        // since a collection's query mix is not known at index-build time.
        let _ = self.index.change_expansion_search(self.ef_search);

        let result = self
            .index
            .search(vector, k)
            .map_err(|e| AppError::IndexError(format!("HNSW search failed: {e}")))?;

        let mut out = Vec::with_capacity(result.keys.len());
        for (label, distance) in result.keys.iter().zip(result.distances.iter()) {
            if let Some(chunk_id) = self.meta.label_to_id.get(&label.to_string()) {
                // usearch's Cos metric returns a distance in [0, 2]; convert
                // to a cosine-similarity score in [-1, 1].
                let score = 1.0 - distance;
                out.push((chunk_id.clone(), score));
            }
        }
        out.truncate(k);
        Ok(out)
    }

    pub fn persist(&mut self) -> AppResult<()> {
        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.index
            .save(self.index_path.to_string_lossy().as_ref())
            .map_err(|e| AppError::IndexError(format!("failed to save HNSW index: {e}")))?;
        self.meta.is_stale = false;
        let bytes = serde_json::to_vec_pretty(&self.meta)?;
        crate::vectorstore::storage::write_atomic(&self.meta_path, &bytes)?;
        Ok(())
    }
}
