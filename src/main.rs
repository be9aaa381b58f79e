#![forbid(unsafe_code)]

//! `stdio-bridge` binary.
//!
//! Loads configuration, starts the HTTP gateway, and on shutdown closes every
//! child session before exiting.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use stdio_bridge::config::BridgeConfig;
use stdio_bridge::gateway::http::{self, GatewayState};
use stdio_bridge::session::SessionRegistry;
use stdio_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stdio-bridge", about = "HTTP bridge to stdio JSON-RPC servers", version, long_about = None)]
struct Cli {
    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Listen port; takes precedence over the config file and `PORT`.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("stdio-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!(
        command = config.command.as_str(),
        port = config.http_port,
        "configuration loaded"
    );

    // ── Build shared state ──────────────────────────────
    let registry = Arc::new(SessionRegistry::from_config(&config));
    let state = Arc::new(GatewayState::new(Arc::clone(&registry), &config));

    // ── Start gateway ───────────────────────────────────
    let ct = CancellationToken::new();
    let http_ct = ct.clone();
    let addr = config.listen_addr();
    let mut http_handle = tokio::spawn(async move { http::serve(addr, state, http_ct).await });

    // ── Wait for shutdown signal or gateway exit ────────
    let early_exit = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut http_handle => Some(joined),
    };
    let served = match early_exit {
        Some(joined) => joined,
        None => {
            info!("shutdown signal received");
            ct.cancel();
            http_handle.await
        }
    };

    let outcome = match served {
        Ok(result) => result,
        Err(err) => Err(AppError::Io(format!("HTTP gateway task panicked: {err}"))),
    };
    if let Err(ref err) = outcome {
        error!(%err, "HTTP gateway failed");
    }

    // ── Tear down sessions ──────────────────────────────
    registry.shutdown().await;
    info!("stdio-bridge shut down");

    outcome
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
