#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # wol-relay
//!
//! Wake-on-LAN relay. A controller on the target LAN keeps one outbound
//! WebSocket open to the relay; operators log in over HTTP and ask the relay
//! to wake a machine, which is forwarded to the controller as a command.
//!
//! ## Subcommands
//!
//! - `wol-relay serve` (default): run both listeners
//! - `wol-relay emulate`: act as a controller against a running relay
//!
//! ## Operator API (`server.listen`, default port 8080)
//!
//! | Method | Path          | Auth    | Description                      |
//! |--------|---------------|---------|----------------------------------|
//! | GET    | `/login`      | No      | Login form                       |
//! | POST   | `/auth`       | No      | Check credentials, set cookie    |
//! | GET    | `/logout`     | No      | Clear cookie                     |
//! | GET    | `/api/health` | No      | Liveness and controller state    |
//! | GET    | `/`           | Cookie  | Control page                     |
//! | GET    | `/api/status` | Cookie  | SSE connectivity stream          |
//! | POST   | `/wol`        | Cookie  | Wake a machine via the controller|
//!
//! ## Tunnel (`tunnel.listen`, default port 8081)
//!
//! Any path upgrades to the controller WebSocket. See [`wol_relay::tunnel`].

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use wol_relay::tunnel::{self, client::EmulatorConfig};
use wol_relay::{routes, AppState, Config};

/// Wake-on-LAN relay with a reverse-tunnel controller.
#[derive(Parser)]
#[command(name = "wol-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Connect to a relay as a controller and send real magic packets.
    Emulate {
        /// Tunnel URL of the relay.
        #[arg(long, default_value = "ws://127.0.0.1:8081/")]
        url: String,
        /// Device id presented in the handshake token.
        #[arg(long, default_value = "emulator")]
        device_id: String,
        /// Shared HMAC secret.
        #[arg(long, env = "HMAC_SECRET")]
        secret: String,
        /// Destination for magic packets.
        #[arg(long, default_value = wol_relay::wol::DEFAULT_BROADCAST)]
        broadcast: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
        Some(Commands::Emulate {
            url,
            device_id,
            secret,
            broadcast,
        }) => {
            init_tracing("info");
            info!("wol-relay v{} emulating controller {device_id}", env!("CARGO_PKG_VERSION"));
            let emulator = tunnel::client::spawn(EmulatorConfig {
                url,
                device_id,
                secret,
                broadcast,
                reconnect_delay: Duration::from_secs(1),
                reconnect_max_delay: Duration::from_secs(30),
            });
            shutdown_signal().await;
            emulator.abort();
            Ok(())
        }
    }
}

fn init_tracing(default_level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    init_tracing(&config.logging.level);

    info!("wol-relay v{} starting", env!("CARGO_PKG_VERSION"));
    for warning in config.warnings() {
        warn!("{warning}");
    }

    let state = AppState::new(config);
    let app = routes::operator_router(state.clone());
    let tunnel_app = tunnel::tunnel_router(state.tunnel.clone());

    let http_listener = TcpListener::bind(&state.config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", state.config.server.listen))?;
    let tunnel_listener = TcpListener::bind(&state.config.tunnel.listen)
        .await
        .with_context(|| format!("Failed to bind {}", state.config.tunnel.listen))?;
    info!("Operator HTTP listening on {}", state.config.server.listen);
    info!("Controller tunnel listening on {}", state.config.tunnel.listen);

    // One signal stops both listeners.
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let stopped = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let http = axum::serve(http_listener, app).with_graceful_shutdown(stopped(stop_rx.clone()));
    let tunnel_server = axum::serve(
        tunnel_listener,
        tunnel_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(after_closing_controller(state.clone(), stopped(stop_rx)));

    let signal = async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    };

    let (http_result, tunnel_result, ()) = tokio::join!(
        async { http.await.context("Operator HTTP server error") },
        async { tunnel_server.await.context("Tunnel server error") },
        signal,
    );
    http_result?;
    tunnel_result?;

    info!("Goodbye");
    Ok(())
}

/// Once `stop` resolves, close the attached controller so its connection
/// task finishes and the tunnel server can drain.
async fn after_closing_controller(state: AppState, stop: impl Future<Output = ()>) {
    stop.await;
    info!("Shutting down...");
    state.tunnel.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
