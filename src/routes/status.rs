//! Server-Sent Events stream of controller connectivity.
//!
//! `GET /api/status`: each observer first receives the current state, then
//! one `status` event per transition. Observers that fall behind skip to the
//! latest value, so the last event delivered always matches the registry.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;

use crate::AppState;

/// `GET /api/status`: SSE connectivity stream.
pub async fn status_stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, &'static str)> {
    // The observer unregisters itself when the response body is dropped.
    let observer = state
        .tunnel
        .registry
        .try_subscribe(state.config.server.max_status_observers)
        .ok_or((StatusCode::TOO_MANY_REQUESTS, "Too many status streams"))?;
    let stream = futures::stream::unfold(observer, |mut observer| async move {
        let connected = observer.next().await?;
        Some((Ok(status_event(connected)), observer))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}

fn status_event(connected: bool) -> Event {
    Event::default()
        .event("status")
        .data(json!({ "connected": connected }).to_string())
}
