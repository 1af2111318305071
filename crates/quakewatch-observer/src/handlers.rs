//! REST endpoint handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/stats` | Cache size and connection statistics |
//! | `GET` | `/quakes` | Every cached event in observation order |
//! | `GET` | `/quakes/{id}` | One cached event |
//! | `GET`, `POST` | `/sync_quakes` | Run a refresh cycle now |
//! | `GET`, `POST` | `/reset` | Drop the cache and the persisted snapshot |
//!
//! Every path is also served under `/api`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use quakewatch_types::{QuakeId, QuakeRecord, Stats, SyncReport};

use crate::error::ObserverError;
use crate::state::AppState;

/// `GET /stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(state.engine.stats())
}

/// `GET /quakes`
pub async fn list_quakes(State(state): State<Arc<AppState>>) -> Json<Vec<QuakeRecord>> {
    Json(state.engine.all_quakes().await)
}

/// `GET /quakes/{id}`
pub async fn get_quake(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QuakeRecord>, ObserverError> {
    let id = QuakeId::from(id);
    state
        .engine
        .quake(&id)
        .await
        .map(Json)
        .ok_or_else(|| ObserverError::NotFound(format!("quake {id} not found")))
}

/// `GET|POST /sync_quakes`
///
/// Runs a refresh cycle immediately. If a scheduled cycle is in flight
/// this waits for it to finish first.
pub async fn sync_quakes(State(state): State<Arc<AppState>>) -> Json<SyncReport> {
    Json(state.engine.run_cycle(Utc::now()).await)
}

/// `GET|POST /reset`
pub async fn reset(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.engine.reset().await;
    (StatusCode::OK, "cache cleared")
}

/// Fallback for unknown paths.
pub async fn not_found() -> ObserverError {
    ObserverError::NotFound("not found".to_owned())
}
