//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    pub queued_generations: usize,
    pub engine_busy: bool,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Returns `{"status": "ok", ...}` with HTTP 200 while the process serves.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let serializer = state.service.serializer();
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.sessions.active(),
        queued_generations: serializer.queued(),
        engine_busy: serializer.is_busy(),
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use spool_engine::EchoEngine;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(
            GatewayConfig::default(),
            Arc::new(EchoEngine::default()),
        ))
    }

    #[tokio::test]
    async fn health_response_has_ok_status() {
        let Json(body) = get_health(State(state())).await;
        assert_eq!(body.status, "ok");
        assert!(!body.version.is_empty());
        assert_eq!(body.active_sessions, 0);
        assert!(!body.engine_busy);
    }

    #[tokio::test]
    async fn health_reports_a_held_slot() {
        let state = state();
        let _slot = state.service.serializer().acquire().await.unwrap();
        let _ticket = state.sessions.admit().unwrap();

        let Json(body) = get_health(State(state.clone())).await;
        assert!(body.engine_busy);
        assert_eq!(body.active_sessions, 1);
    }

    #[tokio::test]
    async fn health_route_serves_json() {
        let app = crate::routes::build(state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-trace-id"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["queued_generations"], 0);
        assert_eq!(value["engine_busy"], false);
    }
}
