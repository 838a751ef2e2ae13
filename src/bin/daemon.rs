use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use code_indexer_core::config::AppConfig;
use code_indexer_core::daemon::Daemon;
use code_indexer_core::embedder::EmbeddingClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();

    let log_dir = std::env::var("CODE_INDEXER_LOG_DIR").unwrap_or_else(|_| {
        std::path::Path::new(&config.data_dir).join("logs").to_string_lossy().to_string()
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "code-indexer-daemon.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "code_indexer_core=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry().with(env_filter).with(stdout_layer).with(file_layer).init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())).unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "code_indexer_core::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    let project_root = std::env::var("CODE_INDEXER_PROJECT_ROOT")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().expect("cwd unavailable"));

    info!(
        socket_path = %config.socket_path,
        data_dir = %config.data_dir,
        project_root = %project_root.display(),
        "code-indexer daemon starting"
    );

    // A missing/unreachable embedding endpoint should not prevent the
    // daemon from serving FTS-only queries; build the client eagerly but
    // keep it optional at the call sites that need it.
    let embedder = match EmbeddingClient::new(&config, guess_dimension(&config)) {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "embedding client unavailable, daemon will serve fts-only queries");
            None
        }
    };

    let daemon = Daemon::new(config, project_root, embedder);
    code_indexer_core::daemon::run(daemon).await?;

    info!("code-indexer daemon shutdown complete");
    Ok(())
}

/// The embedding dimension is authoritative per-collection (see
/// `CollectionManifest`); this is only a placeholder default used to size
/// the client's internal validation until the first collection is opened,
/// at which point `VectorStore::open_collection`'s dimension check is the
/// source of truth.
fn guess_dimension(config: &AppConfig) -> usize {
    std::env::var("CODE_INDEXER_EMBEDDING_DIMENSION")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            let _ = &config.embedding_model;
            1536
        })
}
