// src/routes/health.rs
//! Health check endpoint for the live ingestion service.
//!
//! Used by container orchestrators and the dashboard's connection indicator
//! to verify the service is up. It reports a few in-memory gauges of the
//! live pipeline but never touches the database, so a database outage does
//! not make the ingestion endpoint look dead.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    live_nodes: usize,
    subscribers: usize,
    active_alerts: usize,
    pending_writes: usize,
}

/// Handle `GET /health`.
async fn health(State(session): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        live_nodes: session.live().node_count(),
        subscribers: session.hub().subscriber_count(),
        active_alerts: session.active_alerts(),
        pending_writes: session.pending_writes(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
