//! QuakeWatch service binary.
//!
//! Wires the engine to the GeoNet feed, the snapshot store and the HTTP
//! server, then drives refresh cycles from a fixed timer until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `quakewatch.yaml` plus environment overrides
//! 3. Open the snapshot store (Dragonfly, or in-memory without a URL)
//! 4. Build the GeoNet feed client
//! 5. Create the engine and restore persisted state
//! 6. Start the HTTP server
//! 7. Run the refresh timer until shutdown

mod error;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quakewatch_core::{FeedSource, GeoNetClient, QuakeEngine, ServiceConfig};
use quakewatch_db::{DragonflyPool, MemoryStore, SnapshotStore};
use quakewatch_observer::{AppState, ServerConfig};
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::ServiceError;

/// Path of the optional configuration file, relative to the working
/// directory.
const CONFIG_PATH: &str = "quakewatch.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any startup step fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("quakewatch starting");

    // 2. Load configuration.
    let config = load_config()?;
    info!(
        min_magnitude = config.feed.min_magnitude,
        max_depth_km = config.feed.max_depth_km,
        ttl_days = config.cache.ttl_days,
        interval_seconds = config.refresh.interval_seconds,
        "Configuration loaded"
    );

    // 3. Open the snapshot store.
    let store = open_store(&config).await?;

    // 4. Build the feed client.
    let feed = FeedSource::GeoNet(GeoNetClient::new(&config.feed).map_err(ServiceError::from)?);

    // 5. Create the engine and restore state.
    let interval = Duration::from_secs(config.refresh.interval_seconds);
    let server_config = ServerConfig {
        host: config.infrastructure.observer_host.clone(),
        port: config.infrastructure.observer_port,
    };
    let engine = Arc::new(QuakeEngine::new(config, feed, store));
    let restored = engine.start().await;
    info!(quakes = restored, "Engine ready");

    // 6. Start the HTTP server.
    let app_state = Arc::new(AppState::new(Arc::clone(&engine)));
    let observer_handle = quakewatch_observer::spawn_observer(&server_config, app_state)
        .await
        .map_err(ServiceError::from)?;

    // 7. Refresh timer. The first tick fires immediately.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_seconds = interval.as_secs(), "Entering refresh loop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.run_cycle(Utc::now()).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    observer_handle.abort();
    info!("quakewatch shutdown complete");
    Ok(())
}

/// Load `quakewatch.yaml` if present, otherwise defaults. Environment
/// overrides apply either way.
fn load_config() -> Result<ServiceConfig, ServiceError> {
    let config_path = Path::new(CONFIG_PATH);
    if config_path.exists() {
        Ok(ServiceConfig::from_file(config_path)?)
    } else {
        info!("Config file not found, using defaults");
        Ok(ServiceConfig::parse("")?)
    }
}

/// Connect to Dragonfly when a URL is configured, else keep state in
/// process memory.
async fn open_store(config: &ServiceConfig) -> Result<SnapshotStore, ServiceError> {
    let infra = &config.infrastructure;
    match &infra.dragonfly_url {
        Some(url) => {
            let pool = DragonflyPool::connect(url, &infra.key_prefix).await?;
            Ok(SnapshotStore::Dragonfly(pool))
        }
        None => {
            info!("No Dragonfly URL configured, persisting in memory only");
            Ok(SnapshotStore::Memory(MemoryStore::new()))
        }
    }
}
