use crate::EngineError;

/// Load-time configuration of an engine. Fixed once the engine exists.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Keep the KV cache in half precision.
    pub f16_memory: bool,
    /// Context window in tokens.
    pub context_size: u32,
    /// Allow `embed` calls.
    pub embeddings: bool,
    /// Number of layers to offload to the GPU (0 = CPU only).
    pub gpu_layers: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            f16_memory: true,
            context_size: 128,
            embeddings: true,
            gpu_layers: 0,
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn f16_memory(mut self, v: bool) -> Self {
        self.f16_memory = v;
        self
    }

    pub fn context_size(mut self, n: u32) -> Self {
        self.context_size = n;
        self
    }

    pub fn embeddings(mut self, v: bool) -> Self {
        self.embeddings = v;
        self
    }

    pub fn gpu_layers(mut self, n: u32) -> Self {
        self.gpu_layers = n;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.context_size == 0 {
            return Err(EngineError::InvalidOptions(
                "context_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Per-request sampling parameters.
///
/// The process builds one of these from its configuration at startup and
/// hands a copy to every request; nothing here is global state.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub threads: usize,
    pub max_tokens: usize,
    /// RNG seed; negative means "pick one at random".
    pub seed: i64,
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub stop_words: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_tokens: 512,
            seed: -1,
            top_k: 90,
            top_p: 0.86,
            temperature: 0.8,
            stop_words: vec!["llama".to_owned()],
        }
    }
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn top_k(mut self, k: i32) -> Self {
        self.top_k = k;
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn stop_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_words = words.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.threads == 0 {
            return Err(EngineError::InvalidOptions("threads must be > 0".into()));
        }
        if self.max_tokens == 0 {
            return Err(EngineError::InvalidOptions(
                "max_tokens must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::InvalidOptions(format!(
                "top_p ({}) must be between 0.0 and 1.0",
                self.top_p
            )));
        }
        if self.temperature < 0.0 {
            return Err(EngineError::InvalidOptions(format!(
                "temperature ({}) must not be negative",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// One prompt plus the parameters it is generated with.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            prompt: prompt.into(),
            params,
        }
    }
}
