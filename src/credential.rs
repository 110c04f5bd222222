//! Controller handshake credentials.
//!
//! A controller proves itself with a token of the form
//! `<device-id>-<unix-seconds>` plus the lowercase hex HMAC-SHA256 of that
//! token under the shared tunnel secret. Validation is a pure function of the
//! token, the supplied signature and the caller's clock.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::auth::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

/// Default accepted clock drift between controller and relay.
pub const DEFAULT_MAX_DRIFT_SECS: u64 = 300;

/// Maximum device-id length inside a token.
const MAX_DEVICE_ID_LEN: usize = 64;

/// Reasons a handshake credential is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("token is not of the form <device-id>-<unix-seconds>")]
    MalformedToken,
    #[error("signature does not match token")]
    SignatureMismatch,
    #[error("token timestamp outside the accepted drift window")]
    ExpiredTimestamp,
}

/// An accepted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub device_id: String,
    pub issued_at: u64,
}

/// Validates controller handshake credentials against the shared secret.
#[derive(Clone)]
pub struct CredentialValidator {
    secret: Vec<u8>,
    max_drift_secs: u64,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("max_drift_secs", &self.max_drift_secs)
            .finish_non_exhaustive()
    }
}

impl CredentialValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            max_drift_secs: DEFAULT_MAX_DRIFT_SECS,
        }
    }

    #[must_use]
    pub fn with_max_drift(mut self, secs: u64) -> Self {
        self.max_drift_secs = secs;
        self
    }

    /// Lowercase hex HMAC-SHA256 of `token`.
    pub fn sign(&self, token: &str) -> String {
        // HMAC accepts keys of any length, so construction cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC key of any length is valid"));
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check shape, freshness and signature, in that order.
    ///
    /// Freshness is checked before the signature, so a stale token is always
    /// reported as [`CredentialError::ExpiredTimestamp`].
    pub fn validate(
        &self,
        token: &str,
        signature: &str,
        now: u64,
    ) -> Result<Credential, CredentialError> {
        let (device_id, issued_at) = parse_token(token)?;

        if now.abs_diff(issued_at) >= self.max_drift_secs {
            return Err(CredentialError::ExpiredTimestamp);
        }

        let expected = self.sign(token);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(CredentialError::SignatureMismatch);
        }

        Ok(Credential {
            device_id: device_id.to_string(),
            issued_at,
        })
    }
}

/// Split a token into its device id and timestamp.
fn parse_token(token: &str) -> Result<(&str, u64), CredentialError> {
    let (device_id, ts) = token
        .rsplit_once('-')
        .ok_or(CredentialError::MalformedToken)?;

    let id_ok = !device_id.is_empty()
        && device_id.len() <= MAX_DEVICE_ID_LEN
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !id_ok || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CredentialError::MalformedToken);
    }

    let issued_at = ts.parse().map_err(|_| CredentialError::MalformedToken)?;
    Ok((device_id, issued_at))
}

/// Current Unix time in whole seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
