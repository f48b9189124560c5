//! `POST /reading`: the ingestion endpoint nodes report to.
//!
//! The response is sent once the reading is classified and live state is
//! updated. Broadcast and durable persistence are already handed off by then.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use super::{ApiError, AppState};
use crate::models::{AlertStatus, RawReading};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/reading", get(usage).post(handler))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadingAccepted {
    status: &'static str,
    message: &'static str,
    node_id: String,
    timestamp: DateTime<Utc>,
    alert_status: AlertStatus,
    confirmed_alert: bool,
}

async fn handler(
    State(session): State<AppState>,
    payload: Result<Json<RawReading>, JsonRejection>,
) -> Result<Json<ReadingAccepted>, ApiError> {
    // ---
    let Json(raw) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let reading = raw.validate()?;

    let live = session.ingest(reading, Utc::now()).await;
    if live.confirmed_alert {
        info!(
            "Confirmed {} alert on {} at {}m",
            live.alert_status, live.node_id, live.water_level
        );
    }

    Ok(Json(ReadingAccepted {
        status: "success",
        message: "Reading received",
        node_id: live.node_id,
        timestamp: live.timestamp,
        alert_status: live.alert_status,
        confirmed_alert: live.confirmed_alert,
    }))
}

/// `GET /reading`: a hint for firmware authors probing the endpoint.
async fn usage() -> Json<Value> {
    Json(json!({
        "message": "Reading endpoint is working!",
        "info": "Use POST to send sensor data",
        "example": {
            "nodeId": "Purok 10 River",
            "waterLevel": 2.5
        }
    }))
}
