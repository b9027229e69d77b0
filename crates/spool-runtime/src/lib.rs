//! Access discipline for the single shared engine.
//!
//! - [`GenerationSerializer`] hands out one [`GenerationSlot`] at a time,
//!   FIFO, with an optional bound on the wait queue.
//! - [`start_generation`] runs a blocking `generate` under a slot and
//!   exposes its tokens as a [`TokenStream`].
//! - [`InferenceService`] pairs the two and is what sessions talk to.

mod error;
mod serializer;
mod service;
mod stream;

pub use error::RuntimeError;
pub use serializer::{GenerationSerializer, GenerationSlot};
pub use service::InferenceService;
pub use stream::{
    FinalResult, Generation, GenerationOutcome, StopHandle, TokenEvent, TokenStream,
    start_generation,
};
