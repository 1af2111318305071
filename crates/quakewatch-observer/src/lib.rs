//! HTTP and `WebSocket` surface for QuakeWatch.
//!
//! This crate provides an Axum server that exposes:
//!
//! - **`WebSocket` endpoint** (`/session`) carrying `[event, payload]`
//!   frames to and from the map client
//! - **REST endpoints** for statistics, the full listing, a manual
//!   refresh and a manual cache clear
//!
//! All state lives in the [`QuakeEngine`]; handlers are thin wrappers
//! around its operations.
//!
//! [`QuakeEngine`]: quakewatch_core::QuakeEngine

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod startup;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use error::ObserverError;
pub use router::build_router;
pub use server::{ServerConfig, ServerError};
pub use startup::{StartupError, spawn_observer};
pub use state::AppState;
