use thiserror::Error;

/// Closed error taxonomy for the indexing engine and daemon. The daemon's
/// RPC layer maps these onto `{kind, message, remediation}` frames instead
/// of HTTP status codes (see `daemon::protocol`).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("index error: {0}")]
    IndexError(String),

    #[error("search error: {0}")]
    SearchError(String),

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("embedding dimension mismatch: collection expects {expected}, provider returned {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("indexing already in progress for {0}")]
    IndexingInProgress(String),

    #[error("concurrent indexing session rejected for collection {0}")]
    ConcurrentIndexWrite(String),

    #[error("vector store corrupt: {0}")]
    CorruptStore(String),

    #[error("rate limited by embedding provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    /// A short machine-readable tag used as the RPC frame's `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::CollectionNotFound(_) => "collection_not_found",
            AppError::CollectionAlreadyExists(_) => "collection_already_exists",
            AppError::FileNotFound(_) => "file_not_found",
            AppError::PathNotAllowed(_) => "path_not_allowed",
            AppError::IndexError(_) => "index_error",
            AppError::SearchError(_) => "search_error",
            AppError::EmbeddingProvider(_) => "embedding_provider_error",
            AppError::DimensionMismatch { .. } => "dimension_mismatch",
            AppError::IndexingInProgress(_) => "indexing_in_progress",
            AppError::ConcurrentIndexWrite(_) => "concurrent_index_write",
            AppError::CorruptStore(_) => "corrupt_store",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Io(_) => "io_error",
            AppError::Serde(_) => "serialization_error",
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
        }
    }

    /// Whether a client could plausibly retry the same request unchanged
    /// and expect a different outcome (used by the daemon client helper).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited { .. }
                | AppError::IndexingInProgress(_)
                | AppError::ConcurrentIndexWrite(_)
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
