//! `GET /ws`: the connection acceptor.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use tracing::{Instrument, info_span, warn};

use crate::error::GatewayError;
use crate::session::Session;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// Upgrade the connection and run one [`Session`] on it.
///
/// Any origin is accepted. When the session limit is reached the upgrade is
/// refused with 503.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let ticket = state.sessions.admit()?;
    let service = state.service.clone();
    let config = Arc::clone(&state.config);

    Ok(ws
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let id = ticket.id();
            Session::new(id, socket, service, config)
                .run()
                .instrument(info_span!("session", id))
                .await;
            drop(ticket);
        }))
}
