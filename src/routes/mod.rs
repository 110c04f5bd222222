//! HTTP route handlers for the operator listener.
//!
//! [`health`] and the login flow in [`pages`] are public. The control page
//! requires a session and redirects to `/login` without one; [`status`] and
//! [`wake`] answer `401` instead.

pub mod health;
pub mod pages;
pub mod status;
pub mod wake;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::AppState;

/// Build the operator router.
pub fn operator_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/login", get(pages::login_page))
        .route("/auth", post(pages::login))
        .route("/logout", get(pages::logout))
        .route("/api/health", get(health::health));

    let pages = Router::new()
        .route("/", get(pages::control_page))
        .layer(middleware::from_fn(auth::require_session_page));

    let api = Router::new()
        .route("/api/status", get(status::status_stream))
        .route("/wol", post(wake::wake))
        .layer(middleware::from_fn(auth::require_session_api));

    Router::new()
        .merge(public)
        .merge(pages)
        .merge(api)
        .layer(Extension(state.sessions.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
