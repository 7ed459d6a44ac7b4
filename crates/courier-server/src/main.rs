//! courier-server: real-time messaging relay.
//!
//! Accepts WebSocket connections authenticated by bearer tokens and routes
//! chat messages, delivery receipts and call-signaling frames between
//! connected users.

mod auth;
mod config;
mod handshake;
mod relay;
mod server;
mod transport;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{CliOverrides, ServerConfig};
use courier_core::{Identity, TokenKind};
use server::CourierServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// courier-server: real-time messaging relay
#[derive(Parser, Debug)]
#[command(name = "courier-server", version, about = "Real-time messaging relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.courier/config.toml")]
    config: String,

    /// Seal message and signal content with a per-process key
    #[arg(long)]
    encrypt_payloads: bool,

    /// Send a `failed` ack when a message cannot be delivered
    #[arg(long)]
    notify_undeliverable: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default)
    Serve,
    /// Mint a signed token with the configured secret
    Token {
        /// User id (UUID)
        #[arg(long)]
        user: String,

        /// Role claim
        #[arg(long, default_value = "user")]
        role: String,

        /// Token kind: access, refresh or reset
        #[arg(long, default_value = "access")]
        kind: String,

        /// Lifetime in seconds (defaults to the configured lifetime for the kind)
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind.clone(),
        encrypt_payloads: cli.encrypt_payloads,
        notify_undeliverable: cli.notify_undeliverable,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Command::Token {
            user,
            role,
            kind,
            ttl,
        }) => match mint_token(&server_config, &user, &role, &kind, ttl) {
            Ok(token) => println!("{token}"),
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to mint token");
                std::process::exit(1);
            }
        },
        Some(Command::Serve) | None => serve(server_config).await,
    }
}

async fn serve(server_config: ServerConfig) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.bind_addr,
        "starting courier-server"
    );

    let tokens = match server_config.token_service() {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = %e, "failed to initialise token service");
            std::process::exit(1);
        }
    };

    let courier = match CourierServer::new(server_config, tokens) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };
    let shutdown = courier.shutdown_handle();

    let (_, mut task) = match courier.start().await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    let result = tokio::select! {
        result = &mut task => result,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            let _ = shutdown.send(());
            task.await
        }
    };

    match result {
        Ok(Ok(())) => info!("courier-server stopped"),
        Ok(Err(e)) => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "server task panicked");
            std::process::exit(1);
        }
    }
}

fn mint_token(
    config: &ServerConfig,
    user: &str,
    role: &str,
    kind: &str,
    ttl: Option<u64>,
) -> anyhow::Result<String> {
    if config.jwt_secret.is_none() {
        anyhow::bail!(
            "no JWT secret configured; set {} or [auth].jwt_secret",
            config::SECRET_ENV
        );
    }
    let identity: Identity = user
        .parse()
        .with_context(|| format!("invalid user id {user:?}"))?;
    let kind: TokenKind = kind.parse().map_err(anyhow::Error::msg)?;
    let tokens = config.token_service()?;
    let ttl = ttl
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| tokens.ttl_for(kind));
    Ok(tokens.issue_kind(identity, role, kind, ttl)?)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
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
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
