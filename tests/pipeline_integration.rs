//! End-to-end coverage of the indexing pipeline against a hand-rolled mock
//! embedding HTTP server (no `wiremock`, see `DESIGN.md`): a background
//! thread accepts raw HTTP/1.1 requests on a loopback socket and replies
//! with a deterministic embedding vector derived from the request body
//! length, so re-indexing unchanged content produces the same vectors.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use code_indexer_core::config::AppConfig;
use code_indexer_core::embedder::EmbeddingClient;
use code_indexer_core::fts::FtsIndex;
use code_indexer_core::pipeline::{self, PipelineOptions};
use code_indexer_core::vectorstore::{PointFilter, VectorStore};

const DIMENSION: usize = 8;

/// Starts a background thread that speaks just enough HTTP to satisfy
/// `reqwest`: reads headers, drains the declared `Content-Length` body,
/// and replies with one embedding vector per input text. Returns the
/// endpoint URL and a handle whose drop stops the server by closing the
/// listener (the accept loop exits on the next connection attempt error).
fn spawn_mock_embedding_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock embedding server");
    let addr = listener.local_addr().unwrap();
    let request_count = Arc::new(AtomicUsize::new(0));
    let counter = request_count.clone();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            handle_one_request(stream);
        }
    });

    (format!("http://{addr}/v1/embeddings"), request_count)
}

fn handle_one_request(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut content_length = 0usize;
    loop {
        let n = stream.read(&mut chunk).unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(header_end) = find_header_end(&buf) {
            let header_str = String::from_utf8_lossy(&buf[..header_end]);
            content_length = header_str
                .lines()
                .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    let header_end = find_header_end(&buf).unwrap_or(buf.len());
    let body_start = header_end + 4;
    let body = &buf[body_start.min(buf.len())..];
    let request: serde_json::Value = serde_json::from_slice(body).unwrap_or(serde_json::json!({}));
    let texts = request["texts"].as_array().cloned().unwrap_or_default();

    let data: Vec<serde_json::Value> = texts
        .iter()
        .map(|t| {
            let s = t.as_str().unwrap_or_default();
            let seed = s.len() as f32;
            let embedding: Vec<f32> = (0..DIMENSION).map(|i| (seed + i as f32) / 100.0).collect();
            serde_json::json!({ "embedding": embedding })
        })
        .collect();

    let body = serde_json::to_vec(&serde_json::json!({ "data": data })).unwrap();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn test_config(endpoint: String) -> AppConfig {
    let mut config = AppConfig::from_env();
    config.embedding_endpoint = endpoint;
    config.chunk_size_chars = 200;
    config.chunk_overlap_chars = 20;
    config.embedding_batch_size = 16;
    config.embedding_max_retries = 1;
    config
}

/// S1: basic index + query round trip. A project with two source files is
/// indexed, then a semantic query against the collection returns hits
/// whose payload paths match what was on disk.
#[test]
fn basic_index_and_semantic_query_round_trip() {
    let project = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("auth.rs"), "pub fn login(user: &str) -> bool {\n    verify(user)\n}\n").unwrap();
    std::fs::write(project.path().join("README.md"), "# Demo project\nThis project has a login flow.\n").unwrap();

    let (endpoint, requests) = spawn_mock_embedding_server();
    let config = test_config(endpoint);
    let embedder = EmbeddingClient::new(&config, DIMENSION).expect("build embedding client");

    let store = VectorStore::new(project.path());
    store.open_collection("default", DIMENSION, &config.embedding_model).unwrap();

    let collection_dir = project.path().join(".code-indexer").join("collections").join("default");
    let fts = FtsIndex::open_or_create(&code_indexer_core::fts::fts_dir_for(&collection_dir)).unwrap();

    let options = PipelineOptions::from_config(&config, "default");
    let stats = pipeline::index_project(project.path(), "proj-1", &store, &fts, &embedder, &options, None).unwrap();

    assert_eq!(stats.files_indexed, 2);
    assert!(stats.chunks_indexed >= 2);
    assert!(requests.load(Ordering::SeqCst) > 0);

    let query_vector = embedder.embed_one("login flow").unwrap();
    let hits = store.search("default", &query_vector, 5, 32, &PointFilter::default()).unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().any(|h| h.payload.path == "auth.rs" || h.payload.path == "README.md"));
}

/// S2: resuming an unchanged project must not re-embed any file — the
/// content-hash sidecar should skip every file on the second pass.
#[test]
fn reindexing_unchanged_project_skips_all_files() {
    let project = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("lib.rs"), "pub fn add(a: i32, b: i32) -> i32 { a + b }\n").unwrap();

    let (endpoint, requests) = spawn_mock_embedding_server();
    let config = test_config(endpoint);
    let embedder = EmbeddingClient::new(&config, DIMENSION).unwrap();
    let store = VectorStore::new(project.path());
    store.open_collection("default", DIMENSION, &config.embedding_model).unwrap();
    let collection_dir = project.path().join(".code-indexer").join("collections").join("default");
    let fts = FtsIndex::open_or_create(&code_indexer_core::fts::fts_dir_for(&collection_dir)).unwrap();
    let options = PipelineOptions::from_config(&config, "default");

    let first = pipeline::index_project(project.path(), "proj-1", &store, &fts, &embedder, &options, None).unwrap();
    assert_eq!(first.files_indexed, 1);
    let requests_after_first = requests.load(Ordering::SeqCst);
    assert!(requests_after_first > 0);

    let second = pipeline::index_project(project.path(), "proj-1", &store, &fts, &embedder, &options, None).unwrap();
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.files_skipped_unchanged, 1);
    assert_eq!(requests.load(Ordering::SeqCst), requests_after_first, "unchanged file must not trigger another embedding call");
}

/// S3: files under excluded build directories never reach the index, even
/// though they carry an indexable extension.
#[test]
fn build_output_directories_are_excluded_from_indexing() {
    let project = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(project.path().join("node_modules/pkg")).unwrap();
    std::fs::write(project.path().join("node_modules/pkg/index.js"), "module.exports = {};\n").unwrap();
    std::fs::write(project.path().join("app.js"), "console.log('hello');\n").unwrap();

    let (endpoint, _requests) = spawn_mock_embedding_server();
    let config = test_config(endpoint);
    let embedder = EmbeddingClient::new(&config, DIMENSION).unwrap();
    let store = VectorStore::new(project.path());
    store.open_collection("default", DIMENSION, &config.embedding_model).unwrap();
    let collection_dir = project.path().join(".code-indexer").join("collections").join("default");
    let fts = FtsIndex::open_or_create(&code_indexer_core::fts::fts_dir_for(&collection_dir)).unwrap();
    let options = PipelineOptions::from_config(&config, "default");

    let stats = pipeline::index_project(project.path(), "proj-1", &store, &fts, &embedder, &options, None).unwrap();
    assert_eq!(stats.files_indexed, 1);

    let query_vector = embedder.embed_one("hello").unwrap();
    let hits = store.search("default", &query_vector, 10, 32, &PointFilter::default()).unwrap();
    assert!(hits.iter().all(|h| !h.payload.path.contains("node_modules")));
}

/// S4: FTS search finds a file whose content never reaches the embedding
/// provider at all, since it exercises the FTS path in isolation.
#[test]
fn fts_only_query_finds_indexed_content() {
    let project = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("handler.py"), "def handle_request(req):\n    return authorize(req)\n").unwrap();

    let (endpoint, _requests) = spawn_mock_embedding_server();
    let config = test_config(endpoint);
    let embedder = EmbeddingClient::new(&config, DIMENSION).unwrap();
    let store = VectorStore::new(project.path());
    store.open_collection("default", DIMENSION, &config.embedding_model).unwrap();
    let collection_dir = project.path().join(".code-indexer").join("collections").join("default");
    let fts = FtsIndex::open_or_create(&code_indexer_core::fts::fts_dir_for(&collection_dir)).unwrap();
    let options = PipelineOptions::from_config(&config, "default");

    pipeline::index_project(project.path(), "proj-1", &store, &fts, &embedder, &options, None).unwrap();

    let opts = code_indexer_core::fts::FtsQueryOptions { text: "authorize".to_string(), ..Default::default() };
    let hits = fts.query(&opts).unwrap();
    assert!(hits.iter().any(|h| h.relative_path == "handler.py"));
}
