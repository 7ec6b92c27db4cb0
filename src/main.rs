#![forbid(unsafe_code)]

//! `lockin-relay`: relay server binary.
//!
//! Bootstraps configuration, starts the NDJSON channel listener for
//! students and observers, and the HTTP side channel for flagged audio.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use lockin_proctor::config::GlobalConfig;
use lockin_proctor::relay::{http, spawn_relay, NoopAnalyzer, RelayHub};
use lockin_proctor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "lockin-relay", about = "Exam proctoring relay server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the channel listener address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the directory flagged audio is stored in.
    #[arg(long)]
    audio_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("lockin-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.relay.bind_addr = bind;
    }
    if let Some(dir) = args.audio_dir {
        config.relay.audio_dir = dir;
    }
    info!(bind = %config.relay.bind_addr, "configuration loaded");

    tokio::fs::create_dir_all(&config.relay.audio_dir)
        .await
        .map_err(|err| AppError::Config(format!("cannot create audio dir: {err}")))?;

    // ── Bind listeners ──────────────────────────────────
    let listener = TcpListener::bind(config.relay.bind_addr)
        .await
        .map_err(|err| {
            AppError::Config(format!("failed to bind {}: {err}", config.relay.bind_addr))
        })?;
    let http_addr = SocketAddr::new(config.relay.bind_addr.ip(), config.relay.http_port);
    let http_listener = http::bind(http_addr).await?;

    // ── Start services ──────────────────────────────────
    let ct = CancellationToken::new();
    let hub = Arc::new(RelayHub::new(&config, Arc::new(NoopAnalyzer))?);

    let relay_handle = spawn_relay(
        Arc::clone(&hub),
        listener,
        config.session.handshake_timeout(),
        ct.clone(),
    );

    let http_ct = ct.clone();
    let audio_dir = config.relay.audio_dir.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve_http(http_listener, audio_dir, http_ct).await {
            error!(%err, "http side channel failed");
        }
    });

    info!("relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(relay_handle, http_handle);
    info!("lockin-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
