//! Shared application state for the HTTP server.

use std::sync::Arc;

use quakewatch_core::QuakeEngine;

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The engine that owns the cache and the subscriber hub.
    pub engine: Arc<QuakeEngine>,
}

impl AppState {
    /// Wrap an engine for the router.
    pub const fn new(engine: Arc<QuakeEngine>) -> Self {
        Self { engine }
    }
}
