//! Indexing pipeline orchestrator (C5): enumerate -> hash -> chunk & embed
//! -> persist -> finalize. Grounded on the teacher's `IndexManager`
//! (`indexer.rs`): the gitignore-aware walk, the build/output directory
//! exclusion list, and the content-hash sidecar for skipping unchanged
//! files are all carried over almost verbatim, generalized to feed the
//! new chunker/embedder/vectorstore/fts modules instead of a single
//! Tantivy document per file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::chunker::{self, ChunkError};
use crate::config::AppConfig;
use crate::embedder::EmbeddingClient;
use crate::error::{AppError, AppResult};
use crate::fts::{FtsDocumentInput, FtsIndex};
use crate::lang::detect_language;
use crate::vectorstore::{Payload, PayloadType, VectorPoint, VectorStore};

/// Mirrors the teacher's `is_build_or_output_dir`: catches common build
/// artifacts even when `.gitignore` is absent or incomplete.
pub fn is_build_or_output_dir(path: &Path) -> bool {
    for component in path.components() {
        if let std::path::Component::Normal(name) = component {
            let name_str = name.to_string_lossy();
            let n = name_str.as_ref();
            if matches!(
                n,
                "node_modules"
                    | ".git"
                    | "target"
                    | "dist"
                    | "build"
                    | "out"
                    | ".next"
                    | ".nuxt"
                    | ".output"
                    | ".vite"
                    | ".turbo"
                    | ".svelte-kit"
                    | ".parcel-cache"
                    | "__pycache__"
                    | ".tox"
                    | ".mypy_cache"
                    | ".pytest_cache"
                    | ".ruff_cache"
                    | "coverage"
                    | ".nyc_output"
                    | ".cache"
                    | "vendor"
                    | ".gradle"
                    | ".maven"
                    | ".terraform"
                    | ".eggs"
                    | ".vscode"
                    | ".idea"
                    | ".angular"
                    | ".expo"
                    | ".vercel"
                    | ".netlify"
                    | ".serverless"
                    | ".aws-sam"
                    | "__generated__"
                    | ".cargo"
            ) {
                return true;
            }
            if n.ends_with(".egg-info") {
                return true;
            }
        }
    }
    false
}

pub fn is_indexable(path: &Path) -> bool {
    let ext = path.extension().unwrap_or_default().to_string_lossy().to_lowercase();
    crate::config::is_supported_extension(&ext)
        || path.file_name().is_some_and(|n| {
            let name = n.to_string_lossy().to_lowercase();
            matches!(
                name.as_str(),
                "dockerfile"
                    | "makefile"
                    | "cmakelists.txt"
                    | "cargo.toml"
                    | "package.json"
                    | "tsconfig.json"
                    | "pyproject.toml"
                    | ".gitignore"
                    | ".eslintrc"
                    | ".prettierrc"
                    | "readme"
                    | "license"
                    | "changelog"
                    | "contributing"
            )
        })
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub collection: String,
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
    pub max_file_size_bytes: u64,
    pub embedding_batch_size: usize,
    pub fts_writer_heap_bytes: usize,
    /// When set, HNSW maintenance is deferred (marked stale) instead of
    /// rebuilt/incrementally applied at `end_indexing` — useful for very
    /// large batch reindexes where the caller will trigger a rebuild later.
    pub skip_hnsw: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig, collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            chunk_size_chars: config.chunk_size_chars,
            chunk_overlap_chars: config.chunk_overlap_chars,
            max_file_size_bytes: config.max_file_size_bytes as u64,
            embedding_batch_size: config.embedding_batch_size,
            fts_writer_heap_bytes: config.fts_writer_heap_bytes,
            skip_hnsw: false,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PipelineStats {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_skipped_unchanged: usize,
    pub files_skipped_binary: usize,
    pub files_skipped_too_large: usize,
    pub files_failed: usize,
    pub chunks_indexed: usize,
    pub chunks_deleted: usize,
}

/// A plain-data progress snapshot, cheap to clone and safe to drop: the
/// channel holds only the most recent snapshot, never closures or handles.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSnapshot {
    pub phase: &'static str,
    pub files_done: usize,
    pub files_total: usize,
    pub current_path: Option<String>,
}

/// Bounded, oldest-drop progress sink: publishers never block on a slow
/// subscriber, and a subscriber that reads occasionally only ever sees the
/// latest state.
pub fn send_progress(tx: &Option<tokio::sync::watch::Sender<ProgressSnapshot>>, snapshot: ProgressSnapshot) {
    if let Some(tx) = tx {
        let _ = tx.send(snapshot);
    }
}

struct FileHashSidecar {
    path: PathBuf,
    hashes: HashMap<String, String>,
}

impl FileHashSidecar {
    fn load(collection_dir: &Path) -> Self {
        let path = collection_dir.join("file_hashes.json");
        let hashes = std::fs::read(&path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();
        Self { path, hashes }
    }

    fn persist(&self) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.hashes)?;
        crate::vectorstore::storage::write_atomic(&self.path, &bytes)
    }
}

struct EnumeratedFile {
    absolute_path: PathBuf,
    relative_path: String,
}

fn enumerate_files(project_root: &Path) -> Vec<EnumeratedFile> {
    // Strips Windows UNC prefixes so relative-path computation below
    // matches plain paths from the daemon's RPC callers.
    let project_root = dunce::canonicalize(project_root).unwrap_or_else(|_| project_root.to_path_buf());
    let project_root = project_root.as_path();
    let mut walker = WalkBuilder::new(project_root);
    walker.hidden(false).git_ignore(true).git_exclude(true).git_global(false);

    let mut files = Vec::new();
    for entry in walker.build().flatten() {
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if is_build_or_output_dir(path) || !is_indexable(path) {
            continue;
        }
        let relative = path.strip_prefix(project_root).unwrap_or(path).to_string_lossy().to_string();
        files.push(EnumeratedFile { absolute_path: path.to_path_buf(), relative_path: relative });
    }
    files
}

struct HashedFile {
    file: EnumeratedFile,
    content: String,
    file_hash: String,
}

enum HashOutcome {
    Unchanged,
    Changed(HashedFile),
    Skipped(ChunkError),
}

fn hash_file(file: EnumeratedFile, options: &PipelineOptions, previous_hash: Option<&String>) -> HashOutcome {
    let metadata = match std::fs::metadata(&file.absolute_path) {
        Ok(m) => m,
        Err(e) => return HashOutcome::Skipped(ChunkError::Unreadable(e.to_string())),
    };
    if metadata.len() > options.max_file_size_bytes {
        return HashOutcome::Skipped(ChunkError::TooLarge { size: metadata.len(), max: options.max_file_size_bytes });
    }
    let bytes = match std::fs::read(&file.absolute_path) {
        Ok(b) => b,
        Err(e) => return HashOutcome::Skipped(ChunkError::Unreadable(e.to_string())),
    };
    if chunker::looks_binary(&bytes) {
        return HashOutcome::Skipped(ChunkError::Binary);
    }
    let content = match String::from_utf8(bytes) {
        Ok(c) => c,
        Err(_) => return HashOutcome::Skipped(ChunkError::Binary),
    };
    let file_hash = chunker::hash_bytes(content.as_bytes());
    if previous_hash == Some(&file_hash) {
        return HashOutcome::Unchanged;
    }
    HashOutcome::Changed(HashedFile { file, content, file_hash })
}

/// Runs the full 5-phase pipeline over `project_root` into `collection`.
/// `project_id` is recorded on every payload for multi-project visibility
/// scoping (see the branch/visibility layer).
pub fn index_project(
    project_root: &Path,
    project_id: &str,
    store: &VectorStore,
    fts: &FtsIndex,
    embedder: &EmbeddingClient,
    options: &PipelineOptions,
    progress: Option<&tokio::sync::watch::Sender<ProgressSnapshot>>,
) -> AppResult<PipelineStats> {
    let mut stats = PipelineStats::default();

    // Phase 1: enumerate.
    send_progress(&progress.cloned(), ProgressSnapshot { phase: "enumerate", files_done: 0, files_total: 0, current_path: None });
    let files = enumerate_files(project_root);
    stats.files_scanned = files.len();
    info!(collection = %options.collection, count = files.len(), "enumerated files");

    let collection_dir = project_root.join(".code-indexer").join("collections").join(&options.collection);
    let mut sidecar = FileHashSidecar::load(&collection_dir);

    // Phase 2: hash, in parallel, to find changed files.
    let total = files.len();
    let hashed: Vec<HashOutcome> = files
        .into_par_iter()
        .map(|f| {
            let previous = sidecar.hashes.get(&f.relative_path).cloned();
            hash_file(f, options, previous.as_ref())
        })
        .collect();

    let mut changed = Vec::new();
    for outcome in hashed {
        match outcome {
            HashOutcome::Unchanged => stats.files_skipped_unchanged += 1,
            HashOutcome::Changed(h) => changed.push(h),
            HashOutcome::Skipped(ChunkError::Binary) => stats.files_skipped_binary += 1,
            HashOutcome::Skipped(ChunkError::TooLarge { .. }) => stats.files_skipped_too_large += 1,
            HashOutcome::Skipped(_) => stats.files_failed += 1,
        }
    }

    store.begin_indexing(&options.collection)?;
    let mut fts_docs_owned: Vec<(String, String, String, String, u64, u64, String)> = Vec::new();

    // Phase 3 & 4: chunk, embed in batches, persist atomically per file.
    for (i, hashed_file) in changed.iter().enumerate() {
        send_progress(
            &progress.cloned(),
            ProgressSnapshot {
                phase: "chunk_and_embed",
                files_done: i,
                files_total: total,
                current_path: Some(hashed_file.file.relative_path.clone()),
            },
        );

        let extension = Path::new(&hashed_file.file.relative_path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let language = detect_language(&extension);

        let chunks = chunker::chunk_text(
            &hashed_file.content,
            &hashed_file.file_hash,
            options.chunk_size_chars,
            options.chunk_overlap_chars,
            Some(language),
        );
        if chunks.is_empty() {
            continue;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(options.embedding_batch_size.max(1)) {
            match embedder.embed_batch(batch) {
                Ok(v) => vectors.extend(v),
                Err(e) => {
                    warn!(path = %hashed_file.file.relative_path, error = %e, "embedding failed, skipping file");
                    stats.files_failed += 1;
                    continue;
                }
            }
        }
        if vectors.len() != chunks.len() {
            stats.files_failed += 1;
            continue;
        }

        let file_last_modified = std::fs::metadata(&hashed_file.file.absolute_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors.into_iter())
            .map(|(chunk, vector)| VectorPoint {
                chunk_id: chunk.chunk_id.clone(),
                vector,
                payload: Payload {
                    payload_type: PayloadType::Content,
                    path: hashed_file.file.relative_path.clone(),
                    language: Some(language.to_string()),
                    line_start: chunk.line_start,
                    line_end: chunk.line_end,
                    file_hash: hashed_file.file_hash.clone(),
                    project_id: project_id.to_string(),
                    branch: None,
                    commit: None,
                },
                file_last_modified,
            })
            .collect();

        store.upsert(&options.collection, &points, false)?;
        stats.chunks_indexed += points.len();
        stats.files_indexed += 1;
        sidecar.hashes.insert(hashed_file.file.relative_path.clone(), hashed_file.file_hash.clone());

        let line_end_total = chunks.last().map(|c| c.line_end as u64).unwrap_or(0);
        fts_docs_owned.push((
            hashed_file.file.absolute_path.to_string_lossy().to_string(),
            hashed_file.file.relative_path.clone(),
            hashed_file.content.clone(),
            language.to_string(),
            1,
            line_end_total,
            hashed_file.file_hash.clone(),
        ));
    }

    let fts_docs: Vec<FtsDocumentInput> = fts_docs_owned
        .iter()
        .map(|(path, relative_path, content, language, line_start, line_end, content_hash)| FtsDocumentInput {
            path,
            relative_path,
            content,
            language,
            line_start: *line_start,
            line_end: *line_end,
            content_hash,
        })
        .collect();

    if !fts_docs.is_empty() {
        let rt = tokio::runtime::Handle::try_current();
        match rt {
            Ok(handle) => {
                handle.block_on(fts.reindex_batch(&fts_docs, &[], options.fts_writer_heap_bytes))?;
            }
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| AppError::Internal(e.into()))?;
                rt.block_on(fts.reindex_batch(&fts_docs, &[], options.fts_writer_heap_bytes))?;
            }
        }
    }

    sidecar.persist()?;

    // Phase 5: finalize.
    let session_stats = store.end_indexing(&options.collection, options.skip_hnsw)?;
    stats.chunks_deleted = session_stats.deleted;

    send_progress(
        &progress.cloned(),
        ProgressSnapshot { phase: "done", files_done: total, files_total: total, current_path: None },
    );
    Ok(stats)
}

/// Single-file watch-mode path: re-chunks, re-embeds and re-indexes one
/// file, applying the HNSW update immediately (`watch_mode=true`) rather
/// than deferring to a batch `end_indexing` call.
pub fn index_single_file(
    project_root: &Path,
    relative_path: &str,
    project_id: &str,
    store: &Arc<VectorStore>,
    fts: &Arc<FtsIndex>,
    embedder: &EmbeddingClient,
    options: &PipelineOptions,
) -> AppResult<usize> {
    let absolute_path = project_root.join(relative_path);

    if !absolute_path.exists() {
        store.begin_indexing(&options.collection)?;
        // best-effort: callers pass the known chunk_ids of the removed file
        // via the daemon's watcher, which tracks path -> chunk_ids itself.
        store.end_indexing(&options.collection, options.skip_hnsw)?;
        let rt = tokio::runtime::Runtime::new().map_err(|e| AppError::Internal(e.into()))?;
        rt.block_on(fts.reindex_file(relative_path, None))?;
        return Ok(0);
    }

    let (file_hash, chunks) = chunker::chunk_file(
        &absolute_path,
        options.max_file_size_bytes,
        options.chunk_size_chars,
        options.chunk_overlap_chars,
        None,
    )
    .map_err(|e| AppError::IndexError(e.to_string()))?;

    let extension = Path::new(relative_path).extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
    let language = detect_language(&extension);

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(options.embedding_batch_size.max(1)) {
        vectors.extend(embedder.embed_batch(batch).map_err(|e| AppError::EmbeddingProvider(e.to_string()))?);
    }

    let file_last_modified = std::fs::metadata(&absolute_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let points: Vec<VectorPoint> = chunks
        .iter()
        .zip(vectors.into_iter())
        .map(|(chunk, vector)| VectorPoint {
            chunk_id: chunk.chunk_id.clone(),
            vector,
            payload: Payload {
                payload_type: PayloadType::Content,
                path: relative_path.to_string(),
                language: Some(language.to_string()),
                line_start: chunk.line_start,
                line_end: chunk.line_end,
                file_hash: file_hash.clone(),
                project_id: project_id.to_string(),
                branch: None,
                commit: None,
            },
            file_last_modified,
        })
        .collect();

    store.begin_indexing(&options.collection)?;
    store.upsert(&options.collection, &points, true)?;
    store.end_indexing(&options.collection, options.skip_hnsw)?;

    let content = std::fs::read_to_string(&absolute_path).unwrap_or_default();
    let line_end = chunks.last().map(|c| c.line_end as u64).unwrap_or(0);
    let doc = FtsDocumentInput {
        path: &absolute_path.to_string_lossy(),
        relative_path,
        content: &content,
        language,
        line_start: 1,
        line_end,
        content_hash: &file_hash,
    };
    let rt = tokio::runtime::Runtime::new().map_err(|e| AppError::Internal(e.into()))?;
    rt.block_on(fts.reindex_file(relative_path, Some(&doc)))?;

    Ok(points.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_build_or_output_dir_detects_node_modules() {
        assert!(is_build_or_output_dir(Path::new("/repo/node_modules/foo/index.js")));
        assert!(!is_build_or_output_dir(Path::new("/repo/src/index.js")));
    }

    #[test]
    fn test_is_indexable_by_extension_and_special_name() {
        assert!(is_indexable(Path::new("src/main.rs")));
        assert!(is_indexable(Path::new("Dockerfile")));
        assert!(!is_indexable(Path::new("binary.exe")));
    }

    #[test]
    fn test_enumerate_files_skips_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg.js"), "skip me").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

        let files = enumerate_files(dir.path());
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert!(paths.contains(&"main.rs"));
        assert!(!paths.iter().any(|p| p.contains("node_modules")));
    }
}
