use std::sync::Arc;

use spool_engine::{Engine, GenerationRequest};
use tracing::{debug, instrument};

use crate::stream::{Generation, start_generation};
use crate::{GenerationSerializer, RuntimeError};

/// The one engine of the process plus the serializer guarding it.
///
/// Cheap to clone; every session holds a copy.
#[derive(Clone)]
pub struct InferenceService {
    engine: Arc<dyn Engine>,
    serializer: GenerationSerializer,
}

impl std::fmt::Debug for InferenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceService")
            .field("serializer", &self.serializer)
            .finish_non_exhaustive()
    }
}

impl InferenceService {
    pub fn new(engine: Arc<dyn Engine>, serializer: GenerationSerializer) -> Self {
        Self { engine, serializer }
    }

    pub fn serializer(&self) -> &GenerationSerializer {
        &self.serializer
    }

    /// Wait for the engine, then start streaming `request`.
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation, RuntimeError> {
        let slot = self.serializer.acquire().await?;
        debug!(seq = slot.seq(), prompt_bytes = request.prompt.len(), "starting generation");
        Ok(start_generation(Arc::clone(&self.engine), slot, request))
    }

    /// Compute the embedding of `text` under its own slot.
    ///
    /// This is the second half of a request admitted by [`generate`](Self::generate),
    /// so it waits its turn even when the queue is at its bound.
    #[instrument(level = "debug", skip_all, fields(text_bytes = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RuntimeError> {
        let slot = self.serializer.acquire_admitted().await?;
        let engine = Arc::clone(&self.engine);
        let text = text.to_owned();

        let result = tokio::task::spawn_blocking(move || {
            let embedding = engine.embed(&text);
            debug!(seq = slot.seq(), held_ms = slot.held_for().as_millis() as u64, "embed returned");
            slot.release();
            embedding
        })
        .await
        .map_err(RuntimeError::from_join)?;

        Ok(result?)
    }
}
