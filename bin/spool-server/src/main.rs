//! spool-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from flags and `SPOOL_*` environment variables.
//! 2. Initialise structured tracing (JSON or human-readable).
//! 3. Validate the configuration and load the engine. A load failure is
//!    fatal: the process exits without ever binding the port.
//! 4. Bind the listener and serve `/ws` until SIGINT or SIGTERM.

mod config;

use std::sync::Arc;

use clap::Parser;
use spool_engine::{EchoEngine, Engine, EngineError};
use spool_gateway::AppState;
use tracing::{error, info, warn};

use crate::config::{Backend, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::parse();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "spool-server starting");
    cfg.validate()?;

    // ── 3. Engine ──────────────────────────────────────────────────────────────
    let engine = match load_engine(&cfg) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, model = %cfg.model.display(), "failed to load model");
            return Err(e.into());
        }
    };
    info!(backend = ?cfg.backend, model = %cfg.model.display(), "engine ready");

    // ── 4. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState::new(cfg.gateway_config(), engine));
    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    spool_gateway::serve(listener, state, shutdown_signal()).await?;

    info!("spool-server stopped");
    Ok(())
}

/// Build the log-level filter from `RUST_LOG`, then `--log`, warning loudly
/// if the configured value is not a valid filter expression.
fn init_tracing(cfg: &Config) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SPOOL_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_engine(cfg: &Config) -> Result<Arc<dyn Engine>, EngineError> {
    let options = cfg.engine_options();
    match cfg.backend {
        Backend::Echo => Ok(Arc::new(EchoEngine::load(&cfg.model, options)?)),
        #[cfg(feature = "llama")]
        Backend::Llama => Ok(Arc::new(spool_engine::LlamaEngine::load(&cfg.model, options)?)),
        #[cfg(not(feature = "llama"))]
        Backend::Llama => Err(EngineError::load(
            &cfg.model,
            "this build has no llama backend",
        )),
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
