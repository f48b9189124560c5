//! Route gateway: every endpoint module exports a subrouter that is merged
//! here, so `main.rs` only sees a single `router(session)` call.
//!
//! CORS is open on every route so the browser dashboard can poll `/live`
//! from its own origin.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::Session;

mod error;
mod health;
mod latest;
mod live;
mod reading;
mod ws;

pub use error::ApiError;

// ---

pub type AppState = Arc<Session>;

pub fn router(session: AppState) -> Router {
    // ---
    Router::new()
        .merge(reading::router())
        .merge(live::router())
        .merge(latest::router())
        .merge(ws::router())
        .merge(health::router())
        .layer(CorsLayer::permissive())
        .with_state(session)
}
