use serde::{Deserialize, Serialize};

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Canonical list of file extensions considered indexable and embeddable.
/// Both the Tantivy full-text indexer and the chunking/embedding pipeline
/// use this single list so they never diverge.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // JavaScript / TypeScript
    "ts", "tsx", "js", "jsx", "mjs", "cjs",
    // Systems / compiled
    "rs", "py", "go", "java", "c", "cpp", "h", "hpp",
    "cs", "rb", "php", "swift", "kt", "scala",
    // Web
    "html", "css", "scss", "less", "sass",
    // Data / config
    "json", "yaml", "yml", "toml", "xml",
    // Documentation
    "md", "mdx", "txt", "rst",
    // Query / schema
    "sql", "graphql", "gql",
    // Shell
    "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd",
    // Build / container
    "dockerfile", "makefile",
    // Frontend frameworks
    "vue", "svelte", "astro",
    // Misc languages
    "lua", "zig", "nim", "dart", "elixir", "ex", "exs",
    "r", "jl", "clj", "cljs", "cljc", "erl", "hrl",
    // Infra / IPC
    "tf", "hcl", "proto",
    // Dotfiles / config
    "env", "ini", "cfg", "conf",
];

/// Check whether a file extension (without leading dot, lowercase) is in the
/// shared supported-extensions list.
pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

/// `accuracy` -> HNSW `ef_search` mapping (spec open question, resolved in
/// DESIGN.md): monotonic tiers, matching the examples in the spec verbatim.
pub fn ef_search_for_accuracy(accuracy: &str) -> usize {
    match accuracy {
        "fast" => 32,
        "high" => 256,
        _ => 96, // "balanced" and anything unrecognized
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Unix-domain socket path the daemon binds to.
    pub socket_path: String,
    /// Root directory for all on-disk collection state (vectors, FTS, manifests).
    pub data_dir: String,
    pub max_file_size_bytes: usize,
    pub watcher_debounce_ms: u64,
    pub index_batch_size: usize,

    /// Embedding provider endpoint, e.g. `https://api.example.com/v1/embeddings`.
    pub embedding_endpoint: String,
    /// Bearer token for the embedding provider, if required.
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
    pub embedding_timeout_secs: u64,
    pub embedding_max_retries: u32,
    /// Base delay (seconds) for exponential backoff when the provider gives
    /// no `Retry-After` header.
    pub embedding_retry_base_secs: u64,

    /// Target characters per chunk and overlap between consecutive chunks.
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,

    /// Worker pool size for the indexing pipeline's parallel stages.
    pub pipeline_workers: usize,

    /// Default HNSW `ef_search` tier name (see `ef_search_for_accuracy`).
    pub default_accuracy: String,

    /// Tantivy writer heap size in bytes.
    pub fts_writer_heap_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("CODE_INDEXER_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("code-indexer").to_string_lossy().to_string())
                .unwrap_or_else(|| ".code-indexer-data".to_string())
        });

        let socket_path = std::env::var("CODE_INDEXER_SOCKET").unwrap_or_else(|_| {
            std::path::Path::new(&data_dir)
                .join("daemon.sock")
                .to_string_lossy()
                .to_string()
        });

        Self {
            socket_path,
            max_file_size_bytes: env_usize("CODE_INDEXER_MAX_FILE_SIZE", 10 * 1024 * 1024),
            watcher_debounce_ms: env_u64("CODE_INDEXER_WATCHER_DEBOUNCE_MS", 300),
            index_batch_size: env_usize("CODE_INDEXER_INDEX_BATCH_SIZE", 50),

            embedding_endpoint: std::env::var("CODE_INDEXER_EMBEDDING_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:8081/v1/embeddings".to_string()),
            embedding_api_key: std::env::var("CODE_INDEXER_EMBEDDING_API_KEY").ok(),
            embedding_model: std::env::var("CODE_INDEXER_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            embedding_batch_size: env_usize("CODE_INDEXER_EMBEDDING_BATCH_SIZE", 64),
            embedding_timeout_secs: env_u64("CODE_INDEXER_EMBEDDING_TIMEOUT_SECS", 30),
            embedding_max_retries: env_u64("CODE_INDEXER_EMBEDDING_MAX_RETRIES", 5) as u32,
            embedding_retry_base_secs: env_u64("CODE_INDEXER_EMBEDDING_RETRY_BASE_SECS", 1),

            chunk_size_chars: env_usize("CODE_INDEXER_CHUNK_SIZE_CHARS", 1500),
            chunk_overlap_chars: env_usize("CODE_INDEXER_CHUNK_OVERLAP_CHARS", 200),

            pipeline_workers: env_usize(
                "CODE_INDEXER_PIPELINE_WORKERS",
                std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            ),

            default_accuracy: std::env::var("CODE_INDEXER_DEFAULT_ACCURACY")
                .unwrap_or_else(|_| "balanced".to_string()),

            fts_writer_heap_bytes: env_usize("CODE_INDEXER_FTS_WRITER_HEAP_BYTES", 64 * 1024 * 1024),

            data_dir,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
