#![allow(dead_code)]

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use spool_engine::{Engine, EngineError, GenerationParams};
use spool_gateway::protocol::{self, ERROR_PREFIX};
use spool_gateway::{AppState, GatewayConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SLOW_TOKENS: usize = 40;

/// Instrumented engine.
///
/// - prompts containing `FAIL` make `generate` fail
/// - prompts containing `NOEMBED` make `embed` fail
/// - prompts starting with `slow` emit [`SLOW_TOKENS`] tokens, 10ms apart
/// - anything else is replayed word by word
///
/// Every call records whether another call was already inside the engine.
#[derive(Default)]
pub struct TestEngine {
    inside: AtomicBool,
    pub overlaps: AtomicUsize,
    pub calls: AtomicUsize,
    pub slow_produced: AtomicUsize,
}

impl TestEngine {
    fn enter(&self) {
        if self.inside.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.inside.store(false, Ordering::SeqCst);
    }

    fn run(
        &self,
        prompt: &str,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, EngineError> {
        if prompt.contains("FAIL") {
            return Err(EngineError::Generation("induced failure".into()));
        }

        let mut out = String::new();
        if prompt.starts_with("slow") {
            for i in 0..SLOW_TOKENS {
                std::thread::sleep(Duration::from_millis(10));
                self.slow_produced.fetch_add(1, Ordering::SeqCst);
                let token = format!("s{i} ");
                out.push_str(&token);
                if on_token(&token).is_break() {
                    break;
                }
            }
            return Ok(out);
        }

        for word in prompt.split_inclusive(' ') {
            std::thread::sleep(Duration::from_millis(1));
            out.push_str(word);
            if on_token(word).is_break() {
                break;
            }
        }
        Ok(out)
    }
}

impl Engine for TestEngine {
    fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, EngineError> {
        self.enter();
        let result = self.run(prompt, on_token);
        self.leave();
        result
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        self.enter();
        std::thread::sleep(Duration::from_millis(1));
        let result = if text.contains("NOEMBED") {
            Err(EngineError::Embedding("induced failure".into()))
        } else {
            Ok(expected_embedding(text))
        };
        self.leave();
        result
    }
}

pub fn expected_embedding(text: &str) -> Vec<f32> {
    vec![text.len() as f32, 0.5]
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start(engine: Arc<dyn Engine>, config: GatewayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(config, engine));
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(spool_gateway::serve(listener, Arc::clone(&state), async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> Client {
        let (ws, _) = connect_async(self.url()).await.unwrap();
        ws
    }

    /// Poll until the live session count reaches `n`.
    pub async fn wait_for_sessions(&self, n: usize) {
        for _ in 0..500 {
            if self.state.sessions.active() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {n} sessions, still {}",
            self.state.sessions.active()
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// One complete response: token fragments plus the terminal message.
#[derive(Debug)]
pub struct Reply {
    pub tokens: Vec<String>,
    pub terminal: String,
}

impl Reply {
    pub fn text(&self) -> String {
        self.tokens.concat()
    }

    pub fn is_error(&self) -> bool {
        self.terminal.starts_with(ERROR_PREFIX)
    }

    pub fn embedding_of(&self, prompt: &str) -> bool {
        self.terminal == protocol::embeddings_message(&expected_embedding(prompt))
    }
}

pub async fn send(ws: &mut Client, prompt: &str) {
    ws.send(Message::Text(prompt.into())).await.unwrap();
}

pub async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for the server")
            .expect("connection ended")
            .expect("read failed");
        if let Message::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

pub async fn read_reply(ws: &mut Client) -> Reply {
    let mut tokens = Vec::new();
    loop {
        let text = next_text(ws).await;
        if protocol::is_terminal(&text) {
            return Reply {
                tokens,
                terminal: text,
            };
        }
        tokens.push(text);
    }
}

pub async fn ask(ws: &mut Client, prompt: &str) -> Reply {
    send(ws, prompt).await;
    read_reply(ws).await
}
