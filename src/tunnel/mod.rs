//! Reverse tunnel between the relay and the wake controller.
//!
//! - [`connection`]: per-socket handshake and authenticated loop
//! - [`registry`]: the single "current controller" slot
//! - [`liveness`]: ping/pong probe state machine
//! - [`relay`]: single-flight wake command correlation
//! - [`session`]: shared handle of an authenticated connection
//! - [`client`]: controller emulator (the other end of the tunnel)
//!
//! ## Wire format
//!
//! | Direction           | Frame  | Payload                                  |
//! |---------------------|--------|------------------------------------------|
//! | controller → relay  | text   | `{"token": "<id>-<unix>", "hmac": "<hex>"}` (first frame) |
//! | relay → controller  | text   | `{"mac": "<MAC>", "id": "<uuid>"}`       |
//! | controller → relay  | text   | any JSON, ideally echoing `"id"`         |
//! | relay → controller  | ping   | liveness probe, answered by pong         |

pub mod client;
pub mod connection;
pub mod liveness;
pub mod registry;
pub mod relay;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde::{Deserialize, Serialize};

use crate::config::TunnelConfig;
use crate::credential::CredentialValidator;
use crate::status::StatusBroadcaster;
use registry::TunnelRegistry;
use relay::CommandRelay;
use session::CloseReason;

/// First frame a controller sends on a new tunnel socket.
#[derive(Debug, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub hmac: Option<String>,
}

/// Wake command sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeCommand {
    pub mac: String,
    /// Correlation id; controllers should echo it in their reply.
    #[serde(default)]
    pub id: Option<String>,
}

/// Deadlines governing a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTimings {
    pub auth_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_grace: Duration,
    pub command_timeout: Duration,
}

impl Default for TunnelTimings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            probe_interval: liveness::DEFAULT_PROBE_INTERVAL,
            probe_grace: liveness::DEFAULT_PROBE_GRACE,
            command_timeout: relay::DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl From<&TunnelConfig> for TunnelTimings {
    fn from(c: &TunnelConfig) -> Self {
        Self {
            auth_timeout: Duration::from_millis(c.auth_timeout_ms),
            probe_interval: Duration::from_millis(c.probe_interval_ms),
            probe_grace: Duration::from_millis(c.probe_grace_ms),
            command_timeout: Duration::from_millis(c.command_timeout_ms),
        }
    }
}

/// State shared by the tunnel listener and the operator routes.
#[derive(Clone)]
pub struct TunnelState {
    pub registry: TunnelRegistry,
    pub relay: CommandRelay,
    pub validator: Arc<CredentialValidator>,
    pub timings: TunnelTimings,
    next_session_id: Arc<AtomicU64>,
}

impl TunnelState {
    pub fn new(validator: CredentialValidator, timings: TunnelTimings) -> Self {
        let registry = TunnelRegistry::new(StatusBroadcaster::new());
        let relay = CommandRelay::new(registry.clone(), timings.command_timeout);
        Self {
            registry,
            relay,
            validator: Arc::new(validator),
            timings,
            next_session_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Relay shutdown: end status streams and close the attached controller.
    pub async fn shutdown(&self) {
        self.registry.status().close();
        if let Some(session) = self.registry.close_current(CloseReason::Shutdown).await {
            tracing::info!(session_id = session.id, "Closed controller session for shutdown");
        }
    }
}

/// Router for the tunnel listener. Every path accepts the controller upgrade.
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn tunnel_router(state: TunnelState) -> Router {
    Router::new()
        .fallback(connection::controller_upgrade)
        .with_state(state)
}
