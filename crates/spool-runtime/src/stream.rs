//! Turns the engine's blocking, callback-per-token `generate` into an
//! async [`Stream`] of [`TokenEvent`]s.
//!
//! The engine runs on tokio's blocking pool and pushes every fragment into
//! a channel of capacity 1 with `blocking_send`, so it never runs more than
//! one token ahead of the consumer. Dropping the [`TokenStream`] or raising
//! the [`StopHandle`] makes the next callback return `Break`, which is the
//! only way to end a `generate` call early.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};

use futures::Stream;
use spool_engine::{Engine, GenerationRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{GenerationSlot, RuntimeError};

/// One unit of output. Exactly one terminal event (`Done` or `Failed`) ends
/// every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Token(String),
    Done,
    Failed(String),
}

impl TokenEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenEvent::Token(_))
    }
}

/// What `generate` returned once it finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResult {
    pub text: String,
    /// Generation was cut short by a stop request or a dropped consumer.
    pub stopped: bool,
}

/// Raises the stop signal for one generation.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lazy, finite, ordered sequence of [`TokenEvent`]s.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<TokenEvent>,
    finished: bool,
}

impl Stream for TokenStream {
    type Item = TokenEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TokenEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            None => {
                // Producer went away without a terminal event: it panicked.
                self.finished = true;
                Poll::Ready(Some(TokenEvent::Failed(
                    "generation ended without a result".into(),
                )))
            }
        }
    }
}

/// Resolves once the engine call has returned.
#[derive(Debug)]
pub struct GenerationOutcome {
    handle: JoinHandle<Result<FinalResult, spool_engine::EngineError>>,
}

impl Future for GenerationOutcome {
    type Output = Result<FinalResult, RuntimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let joined = ready!(Pin::new(&mut self.handle).poll(cx));
        Poll::Ready(match joined {
            Ok(result) => result.map_err(RuntimeError::Engine),
            Err(err) => Err(RuntimeError::from_join(err)),
        })
    }
}

/// A running generation: its token stream, its final result and its stop
/// signal.
#[derive(Debug)]
pub struct Generation {
    pub tokens: TokenStream,
    pub outcome: GenerationOutcome,
    stop: StopHandle,
}

impl Generation {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn into_parts(self) -> (TokenStream, GenerationOutcome, StopHandle) {
        (self.tokens, self.outcome, self.stop)
    }
}

/// Run `request` on the engine while holding `slot`.
///
/// The slot moves into the blocking task and is dropped as soon as the
/// engine returns, before the terminal event is sent. Must be called from
/// within a tokio runtime.
pub fn start_generation(
    engine: Arc<dyn Engine>,
    slot: GenerationSlot,
    request: GenerationRequest,
) -> Generation {
    let (tx, rx) = mpsc::channel::<TokenEvent>(1);
    let stop = StopHandle::default();
    let stop_flag = stop.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let seq = slot.seq();
        let mut stopped = false;
        let mut on_token = |token: &str| {
            if stop_flag.is_stopped() {
                stopped = true;
                return ControlFlow::Break(());
            }
            if tx.blocking_send(TokenEvent::Token(token.to_owned())).is_err() {
                stopped = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        };

        let result = engine.generate(&request.prompt, &request.params, &mut on_token);
        debug!(
            seq,
            held_ms = slot.held_for().as_millis() as u64,
            ok = result.is_ok(),
            stopped,
            "generate returned"
        );
        slot.release();

        let terminal = match &result {
            Ok(_) => TokenEvent::Done,
            Err(err) => {
                warn!(seq, error = %err, "generation failed");
                TokenEvent::Failed(err.to_string())
            }
        };
        // The consumer may already be gone.
        let _ = tx.blocking_send(terminal);

        result.map(|text| FinalResult { text, stopped })
    });

    Generation {
        tokens: TokenStream {
            rx,
            finished: false,
        },
        outcome: GenerationOutcome { handle },
        stop,
    }
}
