//! `GET /latest/{node_id}`: the newest row the throttle wrote for a node.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use super::{ApiError, AppState};
use crate::store::ReadingRow;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/latest/{node_id}", get(handler))
}

async fn handler(
    State(session): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<ReadingRow>, ApiError> {
    // ---
    session
        .store()
        .latest_reading(&node_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No recent data for this node".to_string()))
}
