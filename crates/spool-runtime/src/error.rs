use spool_engine::EngineError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Too many sessions are already waiting for the engine.
    #[error("generation queue is full ({depth} requests waiting)")]
    QueueFull { depth: usize },

    /// The engine reported a failure for this request.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The blocking task running the engine panicked or was cancelled.
    #[error("engine task crashed: {0}")]
    EngineCrashed(String),

    /// The serializer was closed; no further slots will be granted.
    #[error("generation serializer is closed")]
    Closed,
}

impl RuntimeError {
    pub(crate) fn from_join(err: JoinError) -> Self {
        if err.is_cancelled() {
            return RuntimeError::EngineCrashed("engine task was cancelled".into());
        }
        let panic = err.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "engine panicked".to_owned());
        RuntimeError::EngineCrashed(message)
    }
}
