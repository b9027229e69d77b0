//! Wire format of the `/ws` endpoint.
//!
//! Inbound, every text frame is one complete prompt. Outbound, a response
//! is zero or more raw token fragments followed by exactly one terminal
//! message: either the embedding block
//!
//! ```text
//! \nEmbeddings: [0.1 -0.25 3]\n
//! ```
//!
//! or an error line starting with [`ERROR_PREFIX`]. Token fragments are sent
//! verbatim, so a fragment that itself begins with `"Error: "` cannot be told
//! apart from an error by framing alone.

use std::fmt::{self, Write as _};

use axum::extract::ws::Message;
use thiserror::Error;

pub const ERROR_PREFIX: &str = "Error: ";
pub const EMBEDDINGS_PREFIX: &str = "\nEmbeddings: [";

/// What an inbound frame means to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Prompt(String),
    /// The client asked to close the connection.
    Close,
    /// Control frames handled by the transport.
    Ignore,
}

/// A frame that cannot be used as a prompt. Reported to the client; the
/// session stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("binary message is not valid UTF-8")]
    NotUtf8,
    #[error("prompt is empty")]
    Empty,
    #[error("prompt is {len} bytes; the limit is {limit}")]
    TooLarge { len: usize, limit: usize },
}

pub fn classify(message: Message, max_prompt_bytes: usize) -> Result<Inbound, Malformed> {
    let prompt = match message {
        Message::Text(text) => text.as_str().to_owned(),
        Message::Binary(bytes) => {
            String::from_utf8(bytes.to_vec()).map_err(|_| Malformed::NotUtf8)?
        }
        Message::Ping(_) | Message::Pong(_) => return Ok(Inbound::Ignore),
        Message::Close(_) => return Ok(Inbound::Close),
    };
    check_prompt(prompt, max_prompt_bytes).map(Inbound::Prompt)
}

/// Size and blank checks shared by every way a prompt can arrive.
pub fn check_prompt(prompt: String, max_prompt_bytes: usize) -> Result<String, Malformed> {
    if prompt.len() > max_prompt_bytes {
        return Err(Malformed::TooLarge {
            len: prompt.len(),
            limit: max_prompt_bytes,
        });
    }
    if prompt.trim().is_empty() {
        return Err(Malformed::Empty);
    }
    Ok(prompt)
}

pub fn error_message(err: impl fmt::Display) -> String {
    format!("{ERROR_PREFIX}{err}")
}

pub fn embeddings_message(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(EMBEDDINGS_PREFIX.len() + embedding.len() * 12 + 2);
    out.push_str(EMBEDDINGS_PREFIX);
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{v}");
    }
    out.push_str("]\n");
    out
}

/// Whether `text` ends a response, judged by framing alone.
///
/// Meant for clients and tests reading a stream back. A token fragment that
/// happens to start with one of the prefixes is misread as terminal; the
/// server itself never calls this.
pub fn is_terminal(text: &str) -> bool {
    text.starts_with(EMBEDDINGS_PREFIX) || text.starts_with(ERROR_PREFIX)
}
