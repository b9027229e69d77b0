//! Gateway policy: the generation parameters every request is run with and
//! the admission bounds around sessions and prompts.

use std::time::Duration;

use spool_engine::GenerationParams;

/// 128 KiB.
pub const DEFAULT_MAX_PROMPT_BYTES: usize = 128 * 1024;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_MAX_PENDING_PER_SESSION: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Concurrent WebSocket sessions; `None` accepts every connection.
    pub max_sessions: Option<usize>,
    /// Largest prompt accepted, in bytes.
    pub max_prompt_bytes: usize,
    /// Sessions allowed to wait for the engine at once; `None` is unbounded.
    pub max_queue_depth: Option<usize>,
    /// Requests one session may send ahead of the one being answered.
    pub max_pending_per_session: usize,
    /// Stop a generation that streams for longer than this.
    pub generation_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sessions: None,
            max_prompt_bytes: DEFAULT_MAX_PROMPT_BYTES,
            max_queue_depth: Some(DEFAULT_MAX_QUEUE_DEPTH),
            max_pending_per_session: DEFAULT_MAX_PENDING_PER_SESSION,
            generation_timeout: None,
        }
    }
}

/// Fixed at startup and shared read-only by every session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    pub generation: GenerationParams,
    pub limits: Limits,
}

impl GatewayConfig {
    pub fn new(generation: GenerationParams, limits: Limits) -> Self {
        Self { generation, limits }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_sessions, None);
        assert_eq!(limits.max_prompt_bytes, 131_072);
        assert_eq!(limits.max_queue_depth, Some(64));
        assert_eq!(limits.max_pending_per_session, 16);
        assert_eq!(limits.generation_timeout, None);
    }
}
