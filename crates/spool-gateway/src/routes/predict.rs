//! One-shot completion over plain HTTP.
//!
//! `GET /predict` takes the prompt from the request body, or from the `q`
//! query parameter when the body is empty, and answers with the whole
//! completion as `text/plain`. It shares the engine queue with `/ws`.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::routing::get;
use futures::StreamExt;
use serde::Deserialize;
use spool_engine::GenerationRequest;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::protocol;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    pub q: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/predict", get(predict))
}

pub async fn predict(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PredictQuery>,
    body: String,
) -> Result<String, GatewayError> {
    let prompt = if body.is_empty() {
        query.q.unwrap_or_default()
    } else {
        body
    };
    let prompt = protocol::check_prompt(prompt, state.config.limits.max_prompt_bytes)?;
    info!(prompt_bytes = prompt.len(), "predict request");

    let completion = match state.config.limits.generation_timeout {
        Some(after) => tokio::time::timeout(after, complete(&state, prompt))
            .await
            .unwrap_or(Err(GatewayError::TimedOut(after))),
        None => complete(&state, prompt).await,
    };
    if let Err(e) = &completion {
        warn!(error = %e, "predict failed");
    }
    completion
}

/// Run one generation to the end and return its text.
async fn complete(state: &AppState, prompt: String) -> Result<String, GatewayError> {
    let request = GenerationRequest::new(prompt, state.config.generation.clone());
    let (mut tokens, outcome, _stop) = state.service.generate(request).await?.into_parts();

    // Dropping the stream early would stop the engine.
    while let Some(event) = tokens.next().await {
        if event.is_terminal() {
            break;
        }
    }
    Ok(outcome.await?.text)
}
