//! Bulk and per-node reads of live state, for polling consumers and for
//! push subscribers catching up after they connect.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use super::{ApiError, AppState};
use crate::live_store::LiveSnapshot;
use crate::models::NodeLiveRecord;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/live", get(all_nodes))
        .route("/live/{node_id}", get(one_node))
}

async fn all_nodes(State(session): State<AppState>) -> Json<LiveSnapshot> {
    Json(session.live().get_all())
}

async fn one_node(
    State(session): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeLiveRecord>, ApiError> {
    // ---
    session
        .live()
        .get(&node_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No live data for node '{node_id}'")))
}
