//! Operator session authentication.
//!
//! Operators log in with the configured user/password and receive a signed
//! session JWT in an HttpOnly `token` cookie. Pages without a valid session
//! redirect to `/login`; API routes answer `401 Unauthorized` instead.

use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "token";

/// Claims carried by an operator session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user: String,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and verifies operator session tokens. Injected into the router as
/// an extension so the middleware can reach it without touching `AppState`.
#[derive(Clone)]
pub struct SessionKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
}

impl SessionKeys {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issue a session token for `user`.
    pub fn issue(&self, user: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = crate::credential::unix_now();
        let claims = SessionClaims {
            user: user.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Validate a session token and return its claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let data =
            jsonwebtoken::decode::<SessionClaims>(token, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }

    fn has_session(&self, headers: &HeaderMap) -> bool {
        session_cookie(headers).is_some_and(|t| self.verify(t).is_ok())
    }
}

/// Extract the session cookie value from the request headers.
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Middleware for pages: no session → `302 /login`.
pub async fn require_session_page(request: Request, next: Next) -> Response {
    match request.extensions().get::<SessionKeys>() {
        Some(keys) if keys.has_session(request.headers()) => next.run(request).await,
        Some(_) => found("/login", None),
        None => config_error(),
    }
}

/// Middleware for API routes: no session → `401 Unauthorized`.
pub async fn require_session_api(request: Request, next: Next) -> Response {
    match request.extensions().get::<SessionKeys>() {
        Some(keys) if keys.has_session(request.headers()) => next.run(request).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Login required", "code": "UNAUTHORIZED"})),
        )
            .into_response(),
        None => config_error(),
    }
}

fn config_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Server configuration error", "code": "CONFIG_ERROR"})),
    )
        .into_response()
}

/// `302 Found` to `location`, optionally setting a cookie.
pub fn found(location: &'static str, cookie: Option<String>) -> Response {
    let mut response = (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    if let Some(cookie) = cookie.and_then(|c| header::HeaderValue::from_str(&c).ok()) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the expected length from response
/// times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
