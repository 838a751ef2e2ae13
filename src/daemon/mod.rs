//! Resident query daemon (C8): binds a Unix domain socket, accepts
//! length-prefixed JSON-framed requests, and serves query/index/stats
//! calls against long-lived `VectorStore`/`FtsIndex`/`EmbeddingClient`
//! handles so repeated queries skip the cold-start cost of reopening
//! on-disk indexes.
//!
//! The accept loop and graceful-shutdown wiring follow the teacher's
//! `main.rs` `shutdown_signal()` shape (ctrl_c + SIGTERM raced via
//! `tokio::select!`), adapted from an axum HTTP server to a raw socket
//! loop.

pub mod protocol;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::embedder::EmbeddingClient;
use crate::error::{AppError, AppResult};
use crate::fts::FtsIndex;
use crate::pipeline::{self, PipelineOptions};
use crate::query::{self, QueryOptions, SearchMode};
use crate::vectorstore::VectorStore;

use protocol::{Frame, QueryOptionsWire, Request, Response};

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Per-collection resident handles. Kept behind a single `Mutex<HashMap>`
/// rather than a `DashMap` since collections are opened lazily and rarely
/// (one lock acquisition per first-touch, not per-query).
struct CollectionCache {
    fts: HashMap<String, Arc<FtsIndex>>,
}

impl CollectionCache {
    fn new() -> Self {
        Self { fts: HashMap::new() }
    }
}

pub struct Daemon {
    config: AppConfig,
    project_root: PathBuf,
    store: Arc<VectorStore>,
    embedder: Option<Arc<EmbeddingClient>>,
    cache: Mutex<CollectionCache>,
}

impl Daemon {
    pub fn new(config: AppConfig, project_root: PathBuf, embedder: Option<EmbeddingClient>) -> Self {
        let store = Arc::new(VectorStore::new(&project_root));
        Self { config, project_root, store, embedder: embedder.map(Arc::new), cache: Mutex::new(CollectionCache::new()) }
    }

    async fn fts_for(&self, collection: &str) -> AppResult<Arc<FtsIndex>> {
        let mut cache = self.cache.lock().await;
        if let Some(f) = cache.fts.get(collection) {
            return Ok(f.clone());
        }
        let dir = self.project_root.join(".code-indexer").join("collections").join(collection);
        let fts_dir = crate::fts::fts_dir_for(&dir);
        let fts = Arc::new(FtsIndex::open_or_create(&fts_dir)?);
        cache.fts.insert(collection.to_string(), fts.clone());
        Ok(fts)
    }

    fn query_options_from_wire(&self, wire: QueryOptionsWire) -> AppResult<QueryOptions> {
        let mut opts = QueryOptions::default();
        if let Some(mode) = wire.search_mode {
            opts.search_mode = match mode.as_str() {
                "semantic" => SearchMode::Semantic,
                "fts" => SearchMode::Fts,
                "hybrid" => SearchMode::Hybrid,
                other => return Err(AppError::BadRequest(format!("unknown search_mode {other}"))),
            };
        }
        if let Some(v) = wire.limit {
            opts.limit = v.clamp(1, 100);
        }
        if let Some(v) = wire.min_score {
            opts.min_score = v;
        }
        opts.language = wire.language;
        opts.exclude_language = wire.exclude_language;
        opts.path_filter = wire.path_filter.unwrap_or_default();
        opts.exclude_path = wire.exclude_path.unwrap_or_default();
        if let Some(a) = wire.accuracy {
            opts.accuracy = a;
        }
        if let Some(v) = wire.case_sensitive {
            opts.case_sensitive = v;
        }
        if let Some(v) = wire.fuzzy {
            opts.fuzzy = v;
        }
        if let Some(v) = wire.edit_distance {
            opts.edit_distance = v.min(3);
        }
        if let Some(v) = wire.regex {
            opts.regex = v;
        }
        if let Some(v) = wire.snippet_lines {
            opts.snippet_lines = v.min(50);
        }
        Ok(opts)
    }

    async fn handle_request(&self, req: Request, shutdown: &tokio::sync::Notify) -> Response {
        let result = self.dispatch(req, shutdown).await;
        match result {
            Ok(resp) => resp,
            Err(e) => Response::from(&e),
        }
    }

    async fn dispatch(&self, req: Request, shutdown: &tokio::sync::Notify) -> AppResult<Response> {
        match req {
            Request::Ping => Ok(Response::Pong),

            Request::Query { collection, text, options } => {
                let opts = self.query_options_from_wire(options)?;
                let fts = self.fts_for(&collection).await.ok();
                let results = query::query(
                    &self.store,
                    fts.as_deref(),
                    self.embedder.as_deref(),
                    &collection,
                    &text,
                    &opts,
                    Some(&self.project_root),
                )
                .await?;
                Ok(Response::QueryResult { results })
            }

            Request::Index { collection, project_root, project_id } => {
                let embedder = self.embedder.clone().ok_or_else(|| {
                    AppError::BadRequest("embedding provider not configured".to_string())
                })?;
                let dimension = embedder.dimension();
                self.store.open_collection(&collection, dimension, embedder.model())?;
                let fts = self.fts_for(&collection).await?;
                let options = PipelineOptions::from_config(&self.config, collection.clone());
                let root = PathBuf::from(project_root);
                let store = self.store.clone();

                // `index_project` ends up calling `EmbeddingClient::embed_batch`,
                // which blocks on its own internal runtime (`Runtime::block_on`)
                // and would panic with "Cannot start a runtime from within a
                // runtime" if run directly on a tokio worker thread. Run the
                // whole pipeline on a blocking thread instead.
                let stats = tokio::task::spawn_blocking(move || {
                    pipeline::index_project(&root, &project_id, &store, &fts, &embedder, &options, None)
                })
                .await
                .map_err(|e| AppError::Internal(e.into()))??;
                Ok(Response::IndexResult { stats })
            }

            Request::Stats { collection } => {
                let dimension = self.store.dimension(&collection)?;
                let (page, _) = self.store.scroll(&collection, &Default::default(), None, usize::MAX)?;
                Ok(Response::StatsResult { vector_count: page.len(), dimension })
            }

            Request::Reload { collection } => {
                self.cache.lock().await.fts.remove(&collection);
                Ok(Response::Reloaded)
            }

            Request::Shutdown => {
                shutdown.notify_waiters();
                Ok(Response::ShuttingDown)
            }
        }
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame(stream: &mut UnixStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn handle_connection(daemon: Arc<Daemon>, mut stream: UnixStream, shutdown: Arc<tokio::sync::Notify>) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "daemon connection read error");
                break;
            }
        };

        let request: Frame<Request> = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                let response = Frame { id: 0, payload: Response::Error { kind: "bad_request".to_string(), message: e.to_string(), remediation: None } };
                if let Ok(bytes) = serde_json::to_vec(&response) {
                    let _ = write_frame(&mut stream, &bytes).await;
                }
                continue;
            }
        };

        let is_shutdown = matches!(request.payload, Request::Shutdown);
        let response_payload = daemon.handle_request(request.payload, &shutdown).await;
        let response = Frame { id: request.id, payload: response_payload };
        if let Ok(bytes) = serde_json::to_vec(&response) {
            let _ = write_frame(&mut stream, &bytes).await;
        }
        if is_shutdown {
            break;
        }
    }
}

/// Binds the daemon's Unix socket and serves connections until a shutdown
/// signal arrives. Binding acts as the single-instance lock: if the socket
/// path is already held by a live daemon, `bind` fails with
/// `AddrInUse` and this function returns cleanly rather than panicking, so
/// a second invocation of the binary is a no-op rather than a crash.
pub async fn run(daemon: Daemon) -> AppResult<()> {
    let socket_path = PathBuf::from(&daemon.config.socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(&socket_path).await.is_ok() {
                tracing::info!(path = %socket_path.display(), "daemon already running on this socket, exiting cleanly");
                return Ok(());
            }
            // Stale socket file with no listener behind it.
            std::fs::remove_file(&socket_path)?;
            UnixListener::bind(&socket_path)?
        }
        Err(e) => return Err(AppError::Io(e)),
    };

    tracing::info!(path = %socket_path.display(), "daemon listening");
    let daemon = Arc::new(daemon);
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let daemon = daemon.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(daemon, stream, shutdown).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown.notified() => {
                tracing::info!("shutdown requested over rpc");
                break;
            }
            _ = ctrl_c => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
            _ = terminate => {
                tracing::info!("received terminate signal, shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
