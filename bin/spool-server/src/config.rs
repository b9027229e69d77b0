//! Process configuration: command-line flags with `SPOOL_*` environment
//! fallbacks. Parsed and validated once at startup; immutable afterwards.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use spool_engine::{EngineOptions, GenerationParams};
use spool_gateway::config::{
    DEFAULT_MAX_PENDING_PER_SESSION, DEFAULT_MAX_PROMPT_BYTES, DEFAULT_MAX_QUEUE_DEPTH,
};
use spool_gateway::{GatewayConfig, Limits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Deterministic engine that replays the prompt; needs no weights.
    Echo,
    /// GGUF model through llama.cpp (requires the `llama` feature).
    Llama,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "llama") {
            Backend::Llama
        } else {
            Backend::Echo
        }
    }
}

/// Streaming inference gateway over WebSocket.
#[derive(Debug, Clone, Parser)]
#[command(name = "spool-server", version, about)]
pub struct Config {
    /// Model file to load.
    #[arg(short = 'm', long, env = "SPOOL_MODEL", default_value = "./models/7B/ggml-model-q4_0.bin")]
    pub model: PathBuf,

    /// Number of layers to offload to the GPU.
    #[arg(long = "ngl", env = "SPOOL_GPU_LAYERS", default_value_t = 0)]
    pub gpu_layers: u32,

    /// Threads per generation (default: available CPUs).
    #[arg(short = 't', long, env = "SPOOL_THREADS")]
    pub threads: Option<usize>,

    /// Maximum tokens generated per request.
    #[arg(short = 'n', long = "tokens", env = "SPOOL_TOKENS", default_value_t = 512)]
    pub max_tokens: usize,

    /// RNG seed; negative picks a random seed per request.
    #[arg(short = 's', long, env = "SPOOL_SEED", default_value_t = -1, allow_negative_numbers = true)]
    pub seed: i64,

    /// Address the WebSocket endpoint listens on.
    #[arg(long, env = "SPOOL_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Context window in tokens.
    #[arg(long, env = "SPOOL_CONTEXT_SIZE", default_value_t = 128)]
    pub context_size: u32,

    #[arg(long, env = "SPOOL_TOP_K", default_value_t = 90)]
    pub top_k: i32,

    #[arg(long, env = "SPOOL_TOP_P", default_value_t = 0.86)]
    pub top_p: f32,

    #[arg(long, env = "SPOOL_TEMPERATURE", default_value_t = 0.8)]
    pub temperature: f32,

    /// Stop word; repeat the flag or separate with commas.
    #[arg(long = "stop", env = "SPOOL_STOP", value_delimiter = ',', default_value = "llama")]
    pub stop_words: Vec<String>,

    /// Load the model without embedding support.
    #[arg(long, env = "SPOOL_NO_EMBEDDINGS")]
    pub no_embeddings: bool,

    /// Keep the KV cache in f32 instead of f16.
    #[arg(long, env = "SPOOL_F32_MEMORY")]
    pub f32_memory: bool,

    #[arg(long, value_enum, env = "SPOOL_BACKEND", default_value_t = Backend::default())]
    pub backend: Backend,

    /// Maximum concurrent WebSocket sessions (default: unlimited).
    #[arg(long, env = "SPOOL_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Largest accepted prompt in bytes.
    #[arg(long, env = "SPOOL_MAX_PROMPT_BYTES", default_value_t = DEFAULT_MAX_PROMPT_BYTES)]
    pub max_prompt_bytes: usize,

    /// Requests allowed to wait for the engine at once; 0 means unbounded.
    #[arg(long, env = "SPOOL_MAX_QUEUE_DEPTH", default_value_t = DEFAULT_MAX_QUEUE_DEPTH)]
    pub max_queue_depth: usize,

    /// Prompts one session may send ahead of the one being answered.
    #[arg(long, env = "SPOOL_MAX_PENDING_PER_SESSION", default_value_t = DEFAULT_MAX_PENDING_PER_SESSION)]
    pub max_pending_per_session: usize,

    /// Stop generations that stream for longer than this many seconds.
    #[arg(long, env = "SPOOL_GENERATION_TIMEOUT_SECS")]
    pub generation_timeout_secs: Option<u64>,

    /// `tracing` filter, e.g. `info` or `debug,tower_http=warn`.
    #[arg(long = "log", env = "SPOOL_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as newline-delimited JSON.
    #[arg(long, env = "SPOOL_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    /// Reject settings that would only fail later, after the model loaded.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine_options()
            .validate()
            .context("invalid engine options")?;
        self.generation_params()
            .validate()
            .context("invalid generation parameters")?;

        if self.max_prompt_bytes == 0 {
            bail!("--max-prompt-bytes must be > 0");
        }
        if self.max_sessions == Some(0) {
            bail!("--max-sessions must be > 0 when set");
        }
        if self.generation_timeout_secs == Some(0) {
            bail!("--generation-timeout-secs must be > 0 when set");
        }
        if self.backend == Backend::Llama && !cfg!(feature = "llama") {
            bail!("the llama backend is not compiled in; rebuild with `--features llama` or use `--backend echo`");
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions::new()
            .f16_memory(!self.f32_memory)
            .context_size(self.context_size)
            .embeddings(!self.no_embeddings)
            .gpu_layers(self.gpu_layers)
    }

    pub fn generation_params(&self) -> GenerationParams {
        let mut params = GenerationParams::new()
            .max_tokens(self.max_tokens)
            .seed(self.seed)
            .top_k(self.top_k)
            .top_p(self.top_p)
            .temperature(self.temperature)
            .stop_words(self.stop_words.iter().filter(|w| !w.is_empty()).cloned());
        if let Some(threads) = self.threads {
            params = params.threads(threads);
        }
        params
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_sessions: self.max_sessions,
            max_prompt_bytes: self.max_prompt_bytes,
            max_queue_depth: (self.max_queue_depth > 0).then_some(self.max_queue_depth),
            max_pending_per_session: self.max_pending_per_session,
            generation_timeout: self.generation_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.generation_params(), self.limits())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("spool-server").chain(args.iter().copied());
        Config::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn defaults_match_the_deployment() {
        let cfg = parse(&["--backend", "echo"]);
        assert_eq!(cfg.model, PathBuf::from("./models/7B/ggml-model-q4_0.bin"));
        assert_eq!(cfg.bind, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.gpu_layers, 0);
        assert_eq!(cfg.max_tokens, 512);
        assert_eq!(cfg.seed, -1);
        assert_eq!(cfg.stop_words, vec!["llama".to_owned()]);

        let opts = cfg.engine_options();
        assert!(opts.f16_memory);
        assert!(opts.embeddings);
        assert_eq!(opts.context_size, 128);

        let limits = cfg.limits();
        assert_eq!(limits.max_sessions, None);
        assert_eq!(limits.max_queue_depth, Some(64));
        assert_eq!(limits.max_pending_per_session, 16);
        assert_eq!(limits.generation_timeout, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_flags() {
        let cfg = parse(&[
            "--backend", "echo", "-m", "m.gguf", "--ngl", "20", "-t", "3", "-n", "64", "-s", "-7",
        ]);
        assert_eq!(cfg.model, PathBuf::from("m.gguf"));
        assert_eq!(cfg.gpu_layers, 20);
        assert_eq!(cfg.engine_options().gpu_layers, 20);

        let params = cfg.generation_params();
        assert_eq!(params.threads, 3);
        assert_eq!(params.max_tokens, 64);
        assert_eq!(params.seed, -7);
    }

    #[test]
    fn stop_words_accept_lists() {
        let cfg = parse(&["--backend", "echo", "--stop", "User:,###", "--stop", "END"]);
        assert_eq!(cfg.generation_params().stop_words, vec!["User:", "###", "END"]);
    }

    #[test]
    fn bounds_are_configurable() {
        let cfg = parse(&[
            "--backend",
            "echo",
            "--max-sessions",
            "10",
            "--max-prompt-bytes",
            "2048",
            "--max-queue-depth",
            "0",
            "--generation-timeout-secs",
            "30",
            "--max-pending-per-session",
            "2",
        ]);
        let limits = cfg.limits();
        assert_eq!(limits.max_sessions, Some(10));
        assert_eq!(limits.max_prompt_bytes, 2048);
        assert_eq!(limits.max_queue_depth, None);
        assert_eq!(limits.generation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(limits.max_pending_per_session, 2);
    }

    #[test]
    fn invalid_values_are_rejected_before_loading() {
        assert!(parse(&["--backend", "echo", "--context-size", "0"]).validate().is_err());
        assert!(parse(&["--backend", "echo", "-n", "0"]).validate().is_err());
        assert!(parse(&["--backend", "echo", "--top-p", "2"]).validate().is_err());
        assert!(parse(&["--backend", "echo", "--max-prompt-bytes", "0"]).validate().is_err());
        assert!(parse(&["--backend", "echo", "--max-sessions", "0"]).validate().is_err());
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        assert!(Config::try_parse_from(["spool-server", "--backend", "gpt"]).is_err());
    }

    #[cfg(not(feature = "llama"))]
    #[test]
    fn llama_backend_needs_the_feature() {
        assert!(parse(&["--backend", "llama"]).validate().is_err());
    }
}
