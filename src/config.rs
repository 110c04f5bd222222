//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HMAC_SECRET`, `JWT_SECRET`, `LOGIN_USER`,
//!    `LOGIN_PASS`, `HTTP_PORT`, `TUNNEL_PORT`
//! 2. **Config file**: path via `--config <path>`, or `wol-relay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"          # operator HTTP
//! max_status_observers = 64
//!
//! [tunnel]
//! listen = "0.0.0.0:8081"          # controller WebSocket
//! hmac_secret = "shared-secret"
//! auth_timeout_ms = 10000
//! probe_interval_ms = 10000
//! probe_grace_ms = 5000
//! command_timeout_ms = 5000
//! max_clock_drift_secs = 300
//!
//! [auth]
//! jwt_secret = "another-secret"
//! login_user = "admin"
//! login_pass = "hunter2"
//! session_ttl_secs = 7200
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "wol-relay.toml";

/// Placeholder secret that triggers startup warnings.
const PLACEHOLDER_SECRET: &str = "change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not a valid port")]
    InvalidPort { var: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    InvalidDuration { field: &'static str },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Operator-facing HTTP listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`). `HTTP_PORT` replaces the port.
    #[serde(default = "default_http_listen")]
    pub listen: String,
    /// Maximum concurrent `/api/status` streams (default 64).
    #[serde(default = "default_max_status_observers")]
    pub max_status_observers: u32,
}

/// Controller tunnel listener and its deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Socket address to bind (default `0.0.0.0:8081`). `TUNNEL_PORT` replaces the port.
    #[serde(default = "default_tunnel_listen")]
    pub listen: String,
    /// Shared HMAC secret for controller handshakes. Override with `HMAC_SECRET`.
    #[serde(default = "default_secret")]
    pub hmac_secret: String,
    /// Time a new socket has to complete the handshake (default 10 000).
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Time between liveness pings (default 10 000).
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Time a ping may stay unanswered (default 5 000).
    #[serde(default = "default_probe_grace_ms")]
    pub probe_grace_ms: u64,
    /// Time a controller has to answer a wake command (default 5 000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Accepted clock drift for handshake tokens (default 300).
    #[serde(default = "default_max_clock_drift_secs")]
    pub max_clock_drift_secs: u64,
}

/// Operator login settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Session token signing secret. Override with `JWT_SECRET`.
    #[serde(default = "default_secret")]
    pub jwt_secret: String,
    /// Override with `LOGIN_USER`.
    #[serde(default = "default_login_user")]
    pub login_user: String,
    /// Override with `LOGIN_PASS`.
    #[serde(default = "default_secret")]
    pub login_pass: String,
    /// Session lifetime (default 2 hours).
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_tunnel_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_max_status_observers() -> u32 {
    64
}
fn default_secret() -> String {
    PLACEHOLDER_SECRET.to_string()
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_probe_interval_ms() -> u64 {
    10_000
}
fn default_probe_grace_ms() -> u64 {
    5_000
}
fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_max_clock_drift_secs() -> u64 {
    crate::credential::DEFAULT_MAX_DRIFT_SECS
}
fn default_login_user() -> String {
    "admin".to_string()
}
fn default_session_ttl_secs() -> u64 {
    2 * 60 * 60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            max_status_observers: default_max_status_observers(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen: default_tunnel_listen(),
            hmac_secret: default_secret(),
            auth_timeout_ms: default_auth_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_grace_ms: default_probe_grace_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_clock_drift_secs: default_max_clock_drift_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_secret(),
            login_user: default_login_user(),
            login_pass: default_secret(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `wol-relay.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the tunnel cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tunnel;
        for (field, value) in [
            ("tunnel.auth_timeout_ms", t.auth_timeout_ms),
            ("tunnel.probe_interval_ms", t.probe_interval_ms),
            ("tunnel.probe_grace_ms", t.probe_grace_ms),
            ("tunnel.command_timeout_ms", t.command_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidDuration { field });
            }
        }
        Ok(())
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("HMAC_SECRET") {
            self.tunnel.hmac_secret = v;
        }
        if let Some(v) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = lookup("LOGIN_USER") {
            self.auth.login_user = v;
        }
        if let Some(v) = lookup("LOGIN_PASS") {
            self.auth.login_pass = v;
        }
        if let Some(v) = lookup("HTTP_PORT") {
            self.server.listen = with_port(&self.server.listen, "HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_PORT") {
            self.tunnel.listen = with_port(&self.tunnel.listen, "TUNNEL_PORT", &v)?;
        }
        Ok(())
    }

    /// Human-readable warnings about insecure settings.
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.tunnel.hmac_secret == PLACEHOLDER_SECRET {
            warnings.push("Using default tunnel HMAC secret: set HMAC_SECRET or update config");
        }
        if self.auth.jwt_secret == PLACEHOLDER_SECRET {
            warnings.push("Using default session secret: set JWT_SECRET or update config");
        }
        if self.auth.login_pass == PLACEHOLDER_SECRET {
            warnings.push("Using default login password: set LOGIN_PASS or update config");
        }
        warnings
    }
}

/// Replace the port of `listen` with `port`.
fn with_port(listen: &str, var: &'static str, port: &str) -> Result<String, ConfigError> {
    let port: u16 = port.trim().parse().map_err(|_| ConfigError::InvalidPort {
        var,
        value: port.to_string(),
    })?;
    let host = listen.rsplit_once(':').map_or("0.0.0.0", |(host, _)| host);
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.server.listen, "0.0.0.0:8080");
        assert_eq!(c.tunnel.listen, "0.0.0.0:8081");
        assert_eq!(c.tunnel.auth_timeout_ms, 10_000);
        assert_eq!(c.tunnel.probe_interval_ms, 10_000);
        assert_eq!(c.tunnel.probe_grace_ms, 5_000);
        assert_eq!(c.tunnel.command_timeout_ms, 5_000);
        assert_eq!(c.tunnel.max_clock_drift_secs, 300);
        assert_eq!(c.auth.session_ttl_secs, 7200);
        assert_eq!(c.warnings().len(), 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c: Config = toml::from_str(
            r#"
            [tunnel]
            hmac_secret = "s3cret"
            probe_grace_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(c.tunnel.hmac_secret, "s3cret");
        assert_eq!(c.tunnel.probe_grace_ms, 2000);
        assert_eq!(c.tunnel.probe_interval_ms, 10_000);
        assert_eq!(c.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn env_overrides_win() {
        let mut c = Config::default();
        c.apply_overrides(env(&[
            ("HMAC_SECRET", "hmac"),
            ("JWT_SECRET", "jwt"),
            ("LOGIN_USER", "op"),
            ("LOGIN_PASS", "pw"),
            ("HTTP_PORT", "3000"),
            ("TUNNEL_PORT", "3001"),
        ]))
        .unwrap();
        assert_eq!(c.tunnel.hmac_secret, "hmac");
        assert_eq!(c.auth.jwt_secret, "jwt");
        assert_eq!(c.auth.login_user, "op");
        assert_eq!(c.auth.login_pass, "pw");
        assert_eq!(c.server.listen, "0.0.0.0:3000");
        assert_eq!(c.tunnel.listen, "0.0.0.0:3001");
        assert!(c.warnings().is_empty());
    }

    #[test]
    fn port_override_keeps_host() {
        assert_eq!(with_port("127.0.0.1:80", "HTTP_PORT", "8080").unwrap(), "127.0.0.1:8080");
        assert_eq!(with_port("[::1]:80", "HTTP_PORT", "81").unwrap(), "[::1]:81");
    }

    #[test]
    fn invalid_port_is_an_error() {
        let mut c = Config::default();
        let err = c
            .apply_overrides(env(&[("TUNNEL_PORT", "70000")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { var: "TUNNEL_PORT", .. }));
    }

    #[test]
    fn zero_deadlines_are_rejected() {
        assert!(Config::default().validate().is_ok());
        for field in [
            "auth_timeout_ms",
            "probe_interval_ms",
            "probe_grace_ms",
            "command_timeout_ms",
        ] {
            let c: Config = toml::from_str(&format!("[tunnel]\n{field} = 0\n")).unwrap();
            let err = c.validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidDuration { field: f } if f.ends_with(field)),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn load_rejects_zero_ping_interval() {
        let path = std::env::temp_dir().join(format!("wol-relay-zero-{}.toml", std::process::id()));
        std::fs::write(&path, "[tunnel]\nprobe_interval_ms = 0\n").unwrap();
        let err = Config::load(path.to_str()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "tunnel.probe_interval_ms" }
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/wol-relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
