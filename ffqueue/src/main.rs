use std::sync::Arc;

use ffqueue::config::EngineConfig;
use ffqueue::notify::BroadcastNotifier;
use ffqueue::store::MemoryStore;
use ffqueue::{Engine, Stores, logging};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (.env included)
    let config = EngineConfig::from_env()?;

    // Initialize logging, keep the guard alive until exit
    let (logging_config, _guard) = logging::init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    tracing::info!(
        ffmpeg = %config.ffmpeg_path,
        max_concurrent_tasks = config.max_concurrent_tasks,
        "Starting ffqueue"
    );

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(BroadcastNotifier::new());
    let engine = Engine::new(&config, Stores::shared(store), notifier);
    engine.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    engine.stop().await;

    Ok(())
}
