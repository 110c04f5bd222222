//! Operator pages and the login flow.

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Form,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::{constant_time_eq, found, SESSION_COOKIE};
use crate::AppState;

const LOGIN_HTML: &str = include_str!("../views/login.html");
const CONTROL_HTML: &str = include_str!("../views/control.html");

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

/// `GET /login`
pub async fn login_page() -> Html<&'static str> {
    Html(LOGIN_HTML)
}

/// `GET /`: wake control page.
pub async fn control_page() -> Html<&'static str> {
    Html(CONTROL_HTML)
}

/// `POST /auth`: check credentials and set the session cookie.
pub async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    let auth = &state.config.auth;
    // Evaluate both so timing does not reveal which one was wrong.
    let user_ok = constant_time_eq(auth.login_user.as_bytes(), form.user.as_bytes());
    let pass_ok = constant_time_eq(auth.login_pass.as_bytes(), form.pass.as_bytes());
    if !(user_ok & pass_ok) {
        warn!(user = %form.user, "Rejected operator login");
        return (StatusCode::UNAUTHORIZED, "Invalid username or password").into_response();
    }

    match state.sessions.issue(&form.user) {
        Ok(token) => {
            info!(user = %form.user, "Operator logged in");
            let cookie = format!(
                "{SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
                state.sessions.ttl_secs()
            );
            found("/", Some(cookie))
        }
        Err(e) => {
            warn!("Failed to issue session token: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session").into_response()
        }
    }
}

/// `GET /logout`: clear the session cookie.
pub async fn logout() -> Response {
    found(
        "/login",
        Some(format!("{SESSION_COOKIE}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0")),
    )
}
