/**
 * Stockpile Sync Daemon
 *
 * Runs the data layer headless: loads configuration, opens the local
 * database and keeps the sync queue flowing until interrupted.
 */
use std::path::PathBuf;
use stockpile::console::{Adapters, Config, Console};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STOCKPILE_CONFIG").ok())
        .map(PathBuf::from);

    let config = Config::load(config_path.as_deref())?;
    tracing::info!(
        "[STARTUP] Remote {} with local state in {}",
        config.remote_url(),
        config.data_dir().display()
    );

    let adapters = Adapters::from_config(&config)?;
    let mut console = Console::open(&config, adapters).await?;
    console.start();
    console.set_link_up(true);

    let status = console.status().await;
    tracing::info!(
        "[STARTUP] {} queued, {} failed, press Ctrl-C to stop",
        status.pending_operations,
        status.failed_operations
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("[STARTUP] Shutting down");

    let remaining = console.pending_count();
    if remaining > 0 {
        tracing::warn!("[STARTUP] {} mutations left in the queue", remaining);
    }
    console.shutdown().await;
    Ok(())
}
