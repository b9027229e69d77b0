//! Engine handle for the spool gateway.
//!
//! An [`Engine`] is loaded once per process and exposes two blocking
//! operations, `generate` and `embed`. Backends are **not** required to be
//! reentrant: the runtime crate guarantees that at most one call is in
//! flight at any instant.
//!
//! # Backends
//!
//! | Type           | Feature  | Notes                                         |
//! |----------------|----------|-----------------------------------------------|
//! | [`EchoEngine`] | always   | Deterministic, no weights. Replays the prompt. |
//! | `LlamaEngine`  | `llama`  | GGUF models through `llama-cpp-2`.            |

mod echo;
mod error;
#[cfg(feature = "llama")]
mod llama;
mod options;
mod stop;

use std::ops::ControlFlow;

pub use echo::{ECHO_EMBEDDING_DIM, EchoEngine};
pub use error::EngineError;
#[cfg(feature = "llama")]
pub use llama::LlamaEngine;
pub use options::{EngineOptions, GenerationParams, GenerationRequest};
pub use stop::{Feed, StopSequences};

/// The inference capability shared by every session.
pub trait Engine: Send + Sync {
    /// Generate a completion for `prompt`.
    ///
    /// `on_token` is invoked synchronously, once per produced fragment and in
    /// production order. Returning [`ControlFlow::Break`] ends generation
    /// early; the text produced so far is still returned as `Ok`.
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, EngineError>;

    /// Compute the embedding vector of `text`.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;
}
