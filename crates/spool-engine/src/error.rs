use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by an [`Engine`](crate::Engine) backend.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The model could not be loaded. Fatal at startup.
    #[error("failed to load model from {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// The engine failed while producing tokens for a prompt.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The engine failed while computing an embedding.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// `embed` was called on an engine loaded with embeddings disabled.
    #[error("embeddings are disabled for this engine")]
    EmbeddingsDisabled,

    /// Options or parameters were rejected before touching the model.
    #[error("invalid engine options: {0}")]
    InvalidOptions(String),
}

impl EngineError {
    pub fn load(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        EngineError::Load {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
