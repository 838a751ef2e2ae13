//! Query engine (C7): semantic / FTS / hybrid search entry point.
//!
//! Hybrid fan-out mirrors the teacher's `spawn_background_indexing`
//! pattern of running full-text and vector work side by side and letting
//! either side fail independently — here via `tokio::join!` instead of
//! two spawned tasks, since both queries are cheap enough to await
//! directly and the caller wants both results back in one response.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ef_search_for_accuracy;
use crate::embedder::EmbeddingClient;
use crate::error::{AppError, AppResult};
use crate::fts::{FtsHit, FtsIndex, FtsQueryOptions};
use crate::vectorstore::{PointFilter, SearchHit, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Fts,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub search_mode: SearchMode,
    pub limit: usize,
    pub min_score: f32,
    pub language: Option<String>,
    pub exclude_language: Option<String>,
    pub path_filter: Vec<String>,
    pub exclude_path: Vec<String>,
    pub accuracy: String,
    pub case_sensitive: bool,
    pub fuzzy: bool,
    pub edit_distance: u8,
    pub regex: bool,
    pub snippet_lines: usize,
    pub annotate_staleness: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::Semantic,
            limit: 10,
            min_score: 0.0,
            language: None,
            exclude_language: None,
            path_filter: Vec::new(),
            exclude_path: Vec::new(),
            accuracy: "balanced".to_string(),
            case_sensitive: false,
            fuzzy: false,
            edit_distance: 2,
            regex: false,
            snippet_lines: 2,
            annotate_staleness: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StalenessInfo {
    pub fresh: bool,
    pub delta_secs: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SemanticResult {
    pub chunk_id: String,
    pub path: String,
    pub language: Option<String>,
    pub line_start: usize,
    pub line_end: usize,
    pub score: f32,
    pub staleness: Option<StalenessInfo>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryMetadata {
    pub fts_available: bool,
    pub semantic_available: bool,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueryResults {
    pub semantic_results: Vec<SemanticResult>,
    pub fts_results: Vec<FtsHit>,
    pub metadata: Option<QueryMetadata>,
}

fn staleness_for(project_root: &Path, path: &str, file_last_modified: i64) -> StalenessInfo {
    let live_mtime = std::fs::metadata(project_root.join(path))
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(file_last_modified);
    let delta = live_mtime - file_last_modified;
    StalenessInfo { fresh: delta <= 0, delta_secs: delta }
}

fn hit_to_result(hit: SearchHit, project_root: Option<&Path>, annotate: bool) -> SemanticResult {
    let staleness = if annotate {
        project_root.map(|root| staleness_for(root, &hit.payload.path, hit.file_last_modified))
    } else {
        None
    };
    SemanticResult {
        chunk_id: hit.chunk_id,
        path: hit.payload.path,
        language: hit.payload.language,
        line_start: hit.payload.line_start,
        line_end: hit.payload.line_end,
        score: hit.score,
        staleness,
    }
}

fn sort_deterministic(results: &mut [SemanticResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line_start.cmp(&b.line_start))
    });
}

fn point_filter(options: &QueryOptions) -> PointFilter {
    PointFilter {
        must_path_globs: options.path_filter.clone(),
        must_not_path_globs: options.exclude_path.clone(),
        language: options.language.clone(),
        exclude_language: options.exclude_language.clone(),
    }
}

async fn run_semantic(
    store: &VectorStore,
    embedder: &EmbeddingClient,
    collection: &str,
    text: &str,
    options: &QueryOptions,
    project_root: Option<&Path>,
) -> AppResult<Vec<SemanticResult>> {
    let dimension = store.dimension(collection)?;
    if dimension != embedder.dimension() {
        return Err(AppError::DimensionMismatch { expected: dimension, actual: embedder.dimension() });
    }

    let vector = tokio::task::block_in_place(|| embedder.embed_one(text))
        .map_err(|e| AppError::EmbeddingProvider(e.to_string()))?;

    let ef_search = ef_search_for_accuracy(&options.accuracy);
    let filter = point_filter(options);
    let hits = store.search(collection, &vector, options.limit, ef_search, &filter)?;

    let mut results: Vec<SemanticResult> = hits
        .into_iter()
        .filter(|h| h.score >= options.min_score)
        .map(|h| hit_to_result(h, project_root, options.annotate_staleness))
        .collect();
    sort_deterministic(&mut results);
    results.truncate(options.limit);
    Ok(results)
}

fn run_fts(fts: &FtsIndex, text: &str, options: &QueryOptions) -> AppResult<Vec<FtsHit>> {
    let opts = FtsQueryOptions {
        text: text.to_string(),
        limit: options.limit,
        case_sensitive: options.case_sensitive,
        fuzzy: options.fuzzy,
        edit_distance: options.edit_distance,
        regex: options.regex,
        snippet_lines: options.snippet_lines,
        language: options.language.clone(),
        exclude_language: options.exclude_language.clone(),
        path_filter: options.path_filter.clone(),
        exclude_path: options.exclude_path.clone(),
    };
    fts.query(&opts)
}

/// Entry point for all three search modes. `project_root` is used only for
/// staleness annotation (`None` skips it, e.g. when the daemon can't see
/// the filesystem the collection was indexed from).
pub async fn query(
    store: &VectorStore,
    fts: Option<&FtsIndex>,
    embedder: Option<&EmbeddingClient>,
    collection: &str,
    text: &str,
    options: &QueryOptions,
    project_root: Option<&Path>,
) -> AppResult<QueryResults> {
    if options.regex && options.fuzzy {
        return Err(AppError::BadRequest("regex and fuzzy are mutually exclusive".to_string()));
    }

    match options.search_mode {
        SearchMode::Semantic => {
            let embedder = embedder.ok_or_else(|| AppError::BadRequest("embedding provider not configured".to_string()))?;
            let semantic_results = run_semantic(store, embedder, collection, text, options, project_root).await?;
            Ok(QueryResults { semantic_results, fts_results: Vec::new(), metadata: None })
        }
        SearchMode::Fts => {
            let fts = fts.ok_or_else(|| {
                AppError::BadRequest("fts index unavailable for this collection; build an fts index first".to_string())
            })?;
            let fts_results = run_fts(fts, text, options)?;
            Ok(QueryResults { semantic_results: Vec::new(), fts_results, metadata: None })
        }
        SearchMode::Hybrid => {
            let semantic_fut = async {
                match embedder {
                    Some(embedder) => run_semantic(store, embedder, collection, text, options, project_root).await,
                    None => Err(AppError::BadRequest("embedding provider not configured".to_string())),
                }
            };

            let (semantic_outcome, fts_outcome) = tokio::join!(semantic_fut, async { fts.map(|f| run_fts(f, text, options)) });

            let (semantic_results, semantic_available, semantic_err) = match semantic_outcome {
                Ok(results) => (results, true, None),
                Err(e) => (Vec::new(), false, Some(e.to_string())),
            };

            let (fts_results, fts_available, fts_err) = match fts_outcome {
                Some(Ok(results)) => (results, true, None),
                Some(Err(e)) => (Vec::new(), false, Some(e.to_string())),
                None => (Vec::new(), false, Some("fts index unavailable for this collection".to_string())),
            };

            let remediation = match (semantic_available, fts_available) {
                (true, true) => None,
                (false, true) => semantic_err,
                (true, false) => Some(fts_err.unwrap_or_else(|| "build fts index".to_string())),
                (false, false) => Some(format!(
                    "semantic: {}; fts: {}",
                    semantic_err.unwrap_or_default(),
                    fts_err.unwrap_or_default()
                )),
            };

            Ok(QueryResults {
                semantic_results,
                fts_results,
                metadata: Some(QueryMetadata { fts_available, semantic_available, remediation }),
            })
        }
    }
}

pub fn unix_seconds_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_deterministic_tie_breaks_on_path() {
        let mut results = vec![
            SemanticResult { chunk_id: "b".into(), path: "b.rs".into(), language: None, line_start: 1, line_end: 1, score: 0.9, staleness: None },
            SemanticResult { chunk_id: "a".into(), path: "a.rs".into(), language: None, line_start: 1, line_end: 1, score: 0.9, staleness: None },
        ];
        sort_deterministic(&mut results);
        assert_eq!(results[0].path, "a.rs");
    }

    #[test]
    fn test_staleness_fresh_when_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        let now = unix_seconds_now();
        let info = staleness_for(dir.path(), "a.rs", now + 10);
        assert!(info.fresh);
    }
}
