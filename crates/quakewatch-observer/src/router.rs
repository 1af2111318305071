//! Axum router construction.
//!
//! Assembles all routes (REST + `WebSocket`) into a single [`Router`]
//! with CORS middleware enabled so the map client can be served from a
//! different origin.

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router.
///
/// The router includes:
/// - `/session` -- `WebSocket` subscriber session (any method; non-upgrade requests get `426`)
/// - `GET /stats` -- statistics
/// - `GET /quakes` -- full listing
/// - `GET /quakes/{id}` -- single cached event
/// - `GET|POST /sync_quakes` -- manual refresh cycle
/// - `GET|POST /reset` -- manual cache clear
///
/// Each route is mounted at the root and again under `/api`. Anything
/// else answers `404`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes())
        .nest("/api", routes())
        .fallback(handlers::not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // WebSocket
        .route("/session", any(ws::session))
        // REST API
        .route("/stats", get(handlers::stats))
        .route("/quakes", get(handlers::list_quakes))
        .route("/quakes/{id}", get(handlers::get_quake))
        .route(
            "/sync_quakes",
            get(handlers::sync_quakes).post(handlers::sync_quakes),
        )
        .route("/reset", get(handlers::reset).post(handlers::reset))
}
