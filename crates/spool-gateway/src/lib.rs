//! WebSocket front end of the spool gateway.
//!
//! Clients connect to `/ws` and send prompts as text frames; each prompt is
//! answered with streamed token fragments followed by an embedding block.
//! All sessions share one engine through
//! [`InferenceService`](spool_runtime::InferenceService), which runs at most
//! one engine call at a time in FIFO order.

pub mod config;
pub mod error;
mod middleware;
pub mod protocol;
mod routes;
pub mod session;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use config::{GatewayConfig, Limits};
pub use error::GatewayError;
pub use routes::build as router;
pub use state::AppState;

/// Serve the gateway on `listener` until `shutdown` resolves.
///
/// Once the server has stopped, the engine queue is closed so sessions still
/// waiting for a slot are told so instead of hanging.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = routes::build(Arc::clone(&state));
    let addr = listener.local_addr()?;
    info!(%addr, "gateway listening on ws://{addr}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    state.service.serializer().close();
    info!("gateway stopped");
    Ok(())
}
