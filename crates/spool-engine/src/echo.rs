//! Deterministic reference engine.
//!
//! `EchoEngine` needs no model file: generation replays the prompt one word
//! at a time and embeddings are a normalised byte histogram. It follows the
//! same contract as a real backend (max tokens, stop words, early stop) so
//! the gateway can be run and exercised end to end without weights.

use std::ops::ControlFlow;
use std::path::Path;

use tracing::debug;

use crate::stop::{Feed, StopSequences};
use crate::{Engine, EngineError, EngineOptions, GenerationParams};

/// Default embedding width.
pub const ECHO_EMBEDDING_DIM: usize = 16;

#[derive(Debug, Clone)]
pub struct EchoEngine {
    options: EngineOptions,
    dim: usize,
}

impl EchoEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            dim: ECHO_EMBEDDING_DIM,
        }
    }

    /// Mirror of a model backend's loader. The path is only recorded in the
    /// log; options are validated the same way a real backend would.
    pub fn load(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self, EngineError> {
        options.validate()?;
        debug!(path = %path.as_ref().display(), "echo engine ready (no weights loaded)");
        Ok(Self::new(options))
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim.max(1);
        self
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Engine for EchoEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, EngineError> {
        params.validate()?;

        let mut stop = StopSequences::new(&params.stop_words);
        let mut output = String::new();
        let mut emit = |text: String, output: &mut String| {
            if text.is_empty() {
                return ControlFlow::Continue(());
            }
            output.push_str(&text);
            on_token(&text)
        };

        for piece in prompt.split_inclusive(' ').take(params.max_tokens) {
            match stop.feed(piece) {
                Feed::Emit(text) => {
                    if emit(text, &mut output).is_break() {
                        return Ok(output);
                    }
                }
                Feed::Stop(text) => {
                    let _ = emit(text, &mut output);
                    return Ok(output);
                }
            }
        }

        let _ = emit(stop.finish(), &mut output);
        Ok(output)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        if !self.options.embeddings {
            return Err(EngineError::EmbeddingsDisabled);
        }

        let mut v = vec![0.0f32; self.dim];
        for (i, b) in text.bytes().enumerate() {
            v[i % self.dim] += f32::from(b) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}
