//! One WebSocket connection's request loop.
//!
//! A session reads one prompt, waits for the engine, streams tokens back as
//! they are produced and finishes the response with an embedding block (or
//! an error line). Every request gets exactly one terminal message, and
//! responses leave in the order their prompts arrived.
//!
//! While a request is queued or streaming the session keeps reading from
//! the client: further prompts are queued behind the current one, and a
//! close frame or a dropped connection stops the running generation. The
//! backlog holds at most `max_pending_per_session` frames; frames beyond it
//! are only counted and answered with an error line at their turn.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use spool_engine::GenerationRequest;
use spool_runtime::{Generation, InferenceService, TokenEvent};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::protocol::{self, Inbound, Malformed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Generating,
    Closed,
}

/// A request waiting its turn on this connection.
enum Pending {
    Prompt(String),
    Malformed(Malformed),
    /// Frames that arrived while the backlog was full.
    Overflow(usize),
}

/// What the client did while the session was busy.
enum ClientActivity {
    Continue,
    Gone,
}

/// How the streaming part of a request ended.
enum StreamEnd {
    Done,
    Failed(String),
    TimedOut(Duration),
    ClientGone,
}

pub struct Session {
    id: u64,
    sink: SplitSink<WebSocket, Message>,
    stream: SplitStream<WebSocket>,
    phase: Phase,
    pending: VecDeque<Pending>,
    service: InferenceService,
    config: Arc<GatewayConfig>,
}

impl Session {
    pub fn new(
        id: u64,
        socket: WebSocket,
        service: InferenceService,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let (sink, stream) = socket.split();
        Self {
            id,
            sink,
            stream,
            phase: Phase::Idle,
            pending: VecDeque::new(),
            service,
            config,
        }
    }

    pub async fn run(mut self) {
        info!(session = self.id, "session opened");
        let mut served = 0u64;

        while self.phase != Phase::Closed {
            let next = match self.pending.pop_front() {
                Some(next) => next,
                None => match self.read_request().await {
                    Some(next) => next,
                    None => break,
                },
            };

            match next {
                Pending::Prompt(prompt) => {
                    self.serve(prompt).await;
                    served += 1;
                }
                Pending::Malformed(malformed) => {
                    warn!(session = self.id, error = %malformed, "malformed message");
                    self.send(protocol::error_message(&malformed)).await;
                }
                Pending::Overflow(dropped) => {
                    let limit = self.config.limits.max_pending_per_session;
                    for _ in 0..dropped {
                        let text = protocol::error_message(format!(
                            "too many requests pending on this session (limit {limit})"
                        ));
                        if !self.send(text).await {
                            break;
                        }
                    }
                }
            }
        }

        self.phase = Phase::Closed;
        let _ = self.sink.close().await;
        info!(session = self.id, served, "session closed");
    }

    /// Block until the client sends something usable. `None` once the
    /// session is over.
    async fn read_request(&mut self) -> Option<Pending> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(session = self.id, error = %e, "read failed");
                    self.phase = Phase::Closed;
                    return None;
                }
                None => {
                    self.phase = Phase::Closed;
                    return None;
                }
            };

            match protocol::classify(message, self.config.limits.max_prompt_bytes) {
                Ok(Inbound::Prompt(prompt)) => return Some(Pending::Prompt(prompt)),
                Ok(Inbound::Ignore) => continue,
                Ok(Inbound::Close) => {
                    debug!(session = self.id, "client closed the connection");
                    self.phase = Phase::Closed;
                    return None;
                }
                Err(malformed) => return Some(Pending::Malformed(malformed)),
            }
        }
    }

    /// Handle a frame that arrived while a request was in flight.
    fn on_busy_read(&mut self, read: Option<Result<Message, axum::Error>>) -> ClientActivity {
        let message = match read {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(session = self.id, error = %e, "read failed during generation");
                return ClientActivity::Gone;
            }
            None => return ClientActivity::Gone,
        };

        match protocol::classify(message, self.config.limits.max_prompt_bytes) {
            Ok(Inbound::Prompt(prompt)) => {
                self.enqueue(Pending::Prompt(prompt));
                ClientActivity::Continue
            }
            Ok(Inbound::Ignore) => ClientActivity::Continue,
            Ok(Inbound::Close) => ClientActivity::Gone,
            Err(malformed) => {
                self.enqueue(Pending::Malformed(malformed));
                ClientActivity::Continue
            }
        }
    }

    /// Queue a frame behind the current request. Past the backlog limit the
    /// frame itself is dropped and only its turn is kept.
    fn enqueue(&mut self, entry: Pending) {
        let limit = self.config.limits.max_pending_per_session;
        if self.pending.len() < limit {
            self.pending.push_back(entry);
            debug!(session = self.id, pending = self.pending.len(), "request queued");
            return;
        }

        warn!(session = self.id, limit, "session backlog full; request refused");
        match self.pending.back_mut() {
            Some(Pending::Overflow(dropped)) => *dropped = dropped.saturating_add(1),
            _ => self.pending.push_back(Pending::Overflow(1)),
        }
    }

    async fn serve(&mut self, prompt: String) {
        info!(session = self.id, prompt_bytes = prompt.len(), "prompt received");
        debug!(session = self.id, prompt = %prompt, "prompt text");

        let Some(generation) = self.start(&prompt).await else {
            return;
        };

        self.phase = Phase::Generating;
        let end = self.forward(generation).await;
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Idle;

        match end {
            StreamEnd::Done => self.finish_with_embedding(&prompt).await,
            StreamEnd::Failed(message) => {
                warn!(session = self.id, error = %message, "generation failed");
                self.send(protocol::error_message(message)).await;
            }
            StreamEnd::TimedOut(after) => {
                warn!(session = self.id, ?after, "generation timed out");
                let text = protocol::error_message(format!("generation timed out after {after:?}"));
                self.send(text).await;
            }
            StreamEnd::ClientGone => {}
        }
    }

    /// Wait for a slot, watching the client meanwhile.
    async fn start(&mut self, prompt: &str) -> Option<Generation> {
        let service = self.service.clone();
        let request = GenerationRequest::new(prompt, self.config.generation.clone());
        let acquire = service.generate(request);
        tokio::pin!(acquire);

        loop {
            tokio::select! {
                res = &mut acquire => match res {
                    Ok(generation) => return Some(generation),
                    Err(e) => {
                        warn!(session = self.id, error = %e, "could not start generation");
                        self.send(protocol::error_message(&e)).await;
                        return None;
                    }
                },
                read = self.stream.next() => {
                    if let ClientActivity::Gone = self.on_busy_read(read) {
                        info!(session = self.id, "client left while queued");
                        self.phase = Phase::Closed;
                        return None;
                    }
                }
            }
        }
    }

    /// Stream tokens to the client until the generation ends.
    async fn forward(&mut self, generation: Generation) -> StreamEnd {
        let (mut tokens, outcome, stop) = generation.into_parts();
        let timeout = self.config.limits.generation_timeout;
        let timer = deadline(timeout.map(|t| Instant::now() + t));
        tokio::pin!(timer);
        let mut timed_out = false;

        let end = loop {
            tokio::select! {
                event = tokens.next() => match event {
                    Some(TokenEvent::Token(token)) => {
                        if timed_out {
                            continue;
                        }
                        if !self.send(token).await {
                            break StreamEnd::ClientGone;
                        }
                    }
                    Some(TokenEvent::Done) => break match timeout {
                        Some(after) if timed_out => StreamEnd::TimedOut(after),
                        _ => StreamEnd::Done,
                    },
                    Some(TokenEvent::Failed(message)) => break StreamEnd::Failed(message),
                    None => break StreamEnd::Failed("token stream ended early".into()),
                },
                read = self.stream.next() => {
                    if let ClientActivity::Gone = self.on_busy_read(read) {
                        break StreamEnd::ClientGone;
                    }
                }
                _ = &mut timer, if !timed_out => {
                    timed_out = true;
                    stop.stop();
                }
            }
        };

        if let StreamEnd::ClientGone = end {
            info!(session = self.id, "client left during generation; stopping");
            stop.stop();
            drop(tokens);
            self.phase = Phase::Closed;
        }

        match outcome.await {
            Ok(result) => {
                debug!(
                    session = self.id,
                    chars = result.text.chars().count(),
                    stopped = result.stopped,
                    "generation finished"
                );
                end
            }
            // The runtime error carries more detail than the stream's
            // terminal event (e.g. a panic message).
            Err(e) => match end {
                StreamEnd::Failed(_) => StreamEnd::Failed(e.to_string()),
                other => other,
            },
        }
    }

    async fn finish_with_embedding(&mut self, prompt: &str) {
        match self.service.embed(prompt).await {
            Ok(embedding) => {
                debug!(session = self.id, dim = embedding.len(), "embedding computed");
                self.send(protocol::embeddings_message(&embedding)).await;
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "embedding failed");
                self.send(protocol::error_message(&e)).await;
            }
        }
    }

    /// Returns `false` (and closes the session) if the write failed.
    async fn send(&mut self, text: String) -> bool {
        if self.phase == Phase::Closed {
            return false;
        }
        match self.sink.send(Message::Text(text.into())).await {
            Ok(()) => true,
            Err(e) => {
                debug!(session = self.id, error = %e, "write failed");
                self.phase = Phase::Closed;
                false
            }
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
