//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::SessionKeys;
use crate::config::Config;
use crate::credential::CredentialValidator;
use crate::tunnel::{TunnelState, TunnelTimings};

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Controller registry, command relay and handshake validator.
    pub tunnel: TunnelState,
    /// Operator session token keys.
    pub sessions: SessionKeys,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let validator = CredentialValidator::new(&config.tunnel.hmac_secret)
            .with_max_drift(config.tunnel.max_clock_drift_secs);
        let tunnel = TunnelState::new(validator, TunnelTimings::from(&config.tunnel));
        let sessions = SessionKeys::new(config.auth.jwt_secret.as_bytes(), config.auth.session_ttl_secs);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            tunnel,
            sessions,
        }
    }
}
