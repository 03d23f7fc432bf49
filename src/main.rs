use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harken::audio_logger::AudioLogger;
use harken::backend;
use harken::config::AppConfig;
use harken::dispatcher::TranscriptionPool;
use harken::server::{self, AppState};
use harken::session::{SessionContext, SessionCounter};

/// Streaming speech-recognition service: WebSocket audio in, VAD events and
/// per-utterance transcripts out.
#[derive(Parser)]
#[command(name = "harken", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Log filter, e.g. "harken=debug" (falls back to RUST_LOG, then info).
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_filter {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AppConfig::load(&cli.config);
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }

    // Models load once, before any connection is accepted.
    let (vad_engine, speech_engine) =
        backend::load_engines(&config.models).context("loading models")?;

    let pool = Arc::new(TranscriptionPool::start(
        speech_engine,
        config.transcribe.worker_count(),
        config.transcribe.max_queue_depth,
        config.transcribe.job_deadline(),
    )?);
    let pool_health = pool.health();

    let audio_log_config = Arc::new(RwLock::new(config.audio_log.clone()));
    let (audio_log, logger) = AudioLogger::new(audio_log_config.clone());
    let logger_task = logger.start();

    let state = AppState {
        sessions: Arc::new(SessionCounter::default()),
        active_sessions: Arc::new(AtomicUsize::new(0)),
        session_ctx: SessionContext {
            vad_engine,
            pool,
            audio_log,
            gate_config: config.vad.gate_config(),
            drain_timeout: config.transcribe.drain_timeout(),
        },
        pool_health,
        audio_log_config,
        model_loaded: true,
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // Dropping the router dropped the last audio-log handle; the logger
    // finishes any in-flight pair and exits.
    logger_task.await?;
    Ok(())
}
