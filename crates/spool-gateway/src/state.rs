//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spool_engine::Engine;
use spool_runtime::{GenerationSerializer, InferenceService};
use tracing::warn;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub service: InferenceService,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(config: GatewayConfig, engine: Arc<dyn Engine>) -> Self {
        let serializer = GenerationSerializer::new(config.limits.max_queue_depth);
        let sessions = SessionRegistry::new(config.limits.max_sessions);
        Self {
            config: Arc::new(config),
            service: InferenceService::new(engine, serializer),
            sessions,
        }
    }
}

/// Counts live sessions and enforces the optional session limit.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    active: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    limit: Option<usize>,
}

/// Held by a session for its whole life; dropping it frees the place.
#[derive(Debug)]
pub struct SessionTicket {
    id: u64,
    active: Arc<AtomicUsize>,
}

impl SessionTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionRegistry {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            limit,
        }
    }

    pub fn admit(&self) -> Result<SessionTicket, GatewayError> {
        let limit = self.limit;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match limit {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .map_err(|active| {
                warn!(active, "session refused: limit reached");
                GatewayError::TooManySessions {
                    limit: limit.unwrap_or(active),
                }
            })?;

        Ok(SessionTicket {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            active: Arc::clone(&self.active),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}
