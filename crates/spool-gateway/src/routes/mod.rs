//! Axum router construction.
//!
//! [`build`] assembles the application router:
//! - `GET /ws`: WebSocket upgrade, one session per connection
//! - `GET /health`: liveness plus session and queue gauges
//! - `GET /predict`: one completion as plain text
//! - permissive CORS and per-request trace ids

mod health;
mod predict;
mod ws;

use std::sync::Arc;

use axum::Router;
use axum::middleware;

use crate::middleware::{cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the gateway.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(predict::router())
        .merge(ws::router())
        // Outermost layers execute first on the way in.
        .layer(cors::cors_layer())
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
