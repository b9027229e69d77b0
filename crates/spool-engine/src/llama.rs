//! `llama-cpp-2` backend.
//!
//! The model weights are loaded once and shared; every `generate` or
//! `embed` call builds its own short-lived `LlamaContext`, so no context
//! ever crosses a thread boundary.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use tracing::{debug, info};

use crate::stop::{Feed, StopSequences};
use crate::{Engine, EngineError, EngineOptions, GenerationParams};

pub struct LlamaEngine {
    backend: LlamaBackend,
    model: LlamaModel,
    options: EngineOptions,
    path: PathBuf,
}

impl std::fmt::Debug for LlamaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaEngine")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl LlamaEngine {
    /// Initialise the llama.cpp backend and load a GGUF model.
    ///
    /// llama.cpp keeps its KV cache in f16 by default, which is what
    /// `f16_memory` asks for; the flag is recorded but needs no extra call.
    pub fn load(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self, EngineError> {
        options.validate()?;
        let path = path.as_ref();

        let backend = LlamaBackend::init().map_err(|e| EngineError::load(path, e))?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| EngineError::load(path, e))?;

        info!(
            path = %path.display(),
            vocab = model.n_vocab(),
            embedding_dim = model.n_embd(),
            train_ctx = model.n_ctx_train(),
            context_size = options.context_size,
            gpu_layers = options.gpu_layers,
            "llama model loaded"
        );

        Ok(Self {
            backend,
            model,
            options,
            path: path.to_path_buf(),
        })
    }

    fn context_params(&self, threads: usize, embeddings: bool) -> LlamaContextParams {
        let threads = i32::try_from(threads).unwrap_or(i32::MAX);
        LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.options.context_size))
            .with_n_batch(self.options.context_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads)
            .with_embeddings(embeddings)
    }
}

fn generation_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Generation(e.to_string())
}

fn embedding_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Embedding(e.to_string())
}

impl Engine for LlamaEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, EngineError> {
        params.validate()?;

        let mut ctx = self
            .model
            .new_context(&self.backend, self.context_params(params.threads, false))
            .map_err(generation_err)?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(generation_err)?;
        let n_ctx = ctx.n_ctx() as usize;
        if tokens.len() >= n_ctx {
            return Err(EngineError::Generation(format!(
                "prompt is {} tokens but the context holds {n_ctx}",
                tokens.len()
            )));
        }

        let mut batch = LlamaBatch::new(n_ctx, 1);
        let last = tokens.len() as i32 - 1;
        for (pos, token) in (0_i32..).zip(tokens.iter()) {
            batch
                .add(*token, pos, &[0], pos == last)
                .map_err(generation_err)?;
        }
        ctx.decode(&mut batch).map_err(generation_err)?;

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::top_k(params.top_k),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(resolve_seed(params.seed)),
        ]);

        let mut stop = StopSequences::new(&params.stop_words);
        let mut output = String::new();
        let mut undecoded: Vec<u8> = Vec::new();
        let mut n_cur = batch.n_tokens();

        for _ in 0..params.max_tokens {
            if n_cur as usize >= n_ctx {
                debug!(n_ctx, "context window exhausted");
                break;
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                break;
            }

            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(generation_err)?;
            undecoded.extend_from_slice(&bytes);
            let piece = take_utf8(&mut undecoded);

            match stop.feed(&piece) {
                Feed::Emit(text) => {
                    if !text.is_empty() {
                        output.push_str(&text);
                        if on_token(&text).is_break() {
                            debug!("generation stopped by caller");
                            return Ok(output);
                        }
                    }
                }
                Feed::Stop(text) => {
                    if !text.is_empty() {
                        output.push_str(&text);
                        let _ = on_token(&text);
                    }
                    return Ok(output);
                }
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(generation_err)?;
            ctx.decode(&mut batch).map_err(generation_err)?;
            n_cur += 1;
        }

        let mut tail = stop.finish();
        tail.push_str(&String::from_utf8_lossy(&undecoded));
        if !tail.is_empty() {
            output.push_str(&tail);
            let _ = on_token(&tail);
        }
        Ok(output)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        if !self.options.embeddings {
            return Err(EngineError::EmbeddingsDisabled);
        }

        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let mut ctx = self
            .model
            .new_context(&self.backend, self.context_params(threads, true))
            .map_err(embedding_err)?;

        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(embedding_err)?;
        if tokens.len() > ctx.n_ctx() as usize {
            return Err(EngineError::Embedding(format!(
                "text is {} tokens but the context holds {}",
                tokens.len(),
                ctx.n_ctx()
            )));
        }

        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        batch.add_sequence(&tokens, 0, false).map_err(embedding_err)?;
        ctx.decode(&mut batch).map_err(embedding_err)?;

        let embedding = match ctx.embeddings_seq_ith(0) {
            Ok(pooled) => pooled.to_vec(),
            Err(_) => ctx
                .embeddings_ith(batch.n_tokens() - 1)
                .map_err(embedding_err)?
                .to_vec(),
        };
        Ok(embedding)
    }
}

fn resolve_seed(seed: i64) -> u32 {
    if seed < 0 {
        RandomState::new().build_hasher().finish() as u32
    } else {
        (seed & 0xFFFF_FFFF) as u32
    }
}

/// Split off the longest valid UTF-8 prefix of `buf`, keeping an incomplete
/// trailing sequence for the next token. Invalid bytes are replaced.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let s = s.to_owned();
            buf.clear();
            s
        }
        Err(e) if e.error_len().is_none() => {
            let rest = buf.split_off(e.valid_up_to());
            String::from_utf8(std::mem::replace(buf, rest)).unwrap_or_default()
        }
        Err(_) => {
            let s = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            s
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn take_utf8_keeps_incomplete_tail() {
        let mut buf = "ok".as_bytes().to_vec();
        buf.extend_from_slice(&"é".as_bytes()[..1]);
        assert_eq!(take_utf8(&mut buf), "ok");
        assert_eq!(buf.len(), 1);
        buf.extend_from_slice(&"é".as_bytes()[1..]);
        assert_eq!(take_utf8(&mut buf), "é");
        assert!(buf.is_empty());
    }

    #[test]
    fn take_utf8_replaces_invalid_bytes() {
        let mut buf = vec![b'a', 0xFF, b'b'];
        assert_eq!(take_utf8(&mut buf), "a\u{FFFD}b");
        assert!(buf.is_empty());
    }

    #[test]
    fn explicit_seed_is_kept() {
        assert_eq!(resolve_seed(42), 42);
    }

    #[test]
    fn missing_model_is_a_load_error() {
        let err = LlamaEngine::load("/nonexistent/model.gguf", EngineOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Load { .. }));
    }
}
