//! Wire protocol for the resident daemon: length-prefixed JSON frames over
//! a Unix domain socket. Grounded on the teacher's `ServerEvent` broadcast
//! enum shape (`state.rs`) and `AppError`'s RPC mapping — generalized from
//! "broadcast event over a WebSocket" to "one request, one correlated
//! response" since the daemon has no browser client to push events to.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::pipeline::PipelineStats;
use crate::query::QueryResults;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Query {
        collection: String,
        text: String,
        #[serde(default)]
        options: QueryOptionsWire,
    },
    Index {
        collection: String,
        project_root: String,
        project_id: String,
    },
    Stats {
        collection: String,
    },
    Reload {
        collection: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryOptionsWire {
    pub search_mode: Option<String>,
    pub limit: Option<usize>,
    pub min_score: Option<f32>,
    pub language: Option<String>,
    pub exclude_language: Option<String>,
    pub path_filter: Option<Vec<String>>,
    pub exclude_path: Option<Vec<String>>,
    pub accuracy: Option<String>,
    pub case_sensitive: Option<bool>,
    pub fuzzy: Option<bool>,
    pub edit_distance: Option<u8>,
    pub regex: Option<bool>,
    pub snippet_lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame<T> {
    pub id: u64,
    pub payload: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    QueryResult { results: QueryResults },
    IndexResult { stats: PipelineStats },
    StatsResult { vector_count: usize, dimension: usize },
    Reloaded,
    ShuttingDown,
    Error { kind: String, message: String, remediation: Option<String> },
}

impl From<&AppError> for Response {
    fn from(err: &AppError) -> Self {
        let remediation = match err {
            AppError::CollectionNotFound(_) => Some("create the collection before querying it".to_string()),
            AppError::DimensionMismatch { .. } => Some("re-create the collection with the new embedding dimension".to_string()),
            AppError::ConcurrentIndexWrite(_) => Some("wait for the in-flight indexing session to finish".to_string()),
            AppError::RateLimited { .. } => Some("retry after the indicated delay".to_string()),
            _ => None,
        };
        Response::Error { kind: err.kind().to_string(), message: err.to_string(), remediation }
    }
}
