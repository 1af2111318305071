//! Server startup helper for the service binary.
//!
//! [`spawn_observer`] binds the listener eagerly, so a port clash is
//! reported to the caller, then serves on a background Tokio task that
//! runs alongside the refresh timer.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::server::{self, ServerConfig, ServerError};
use crate::state::AppState;

/// Errors that can occur when spawning the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The server failed to bind or start.
    #[error("server start error: {0}")]
    Server(#[from] ServerError),
}

/// Bind `config` and serve the router on a background task.
///
/// The caller should hold the returned handle and abort it during
/// shutdown.
///
/// # Errors
///
/// Returns [`StartupError::Server`] if the address is invalid or cannot
/// be bound.
pub async fn spawn_observer(
    config: &ServerConfig,
    state: Arc<AppState>,
) -> Result<JoinHandle<()>, StartupError> {
    let listener = server::bind(config).await?;

    let handle = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state).await {
            tracing::error!(error = %e, "HTTP server exited with error");
        }
    });

    tracing::info!(host = %config.host, port = config.port, "HTTP server spawned on background task");

    Ok(handle)
}
