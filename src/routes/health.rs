//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Reports uptime and version, the attached controller (if any) with its
/// probe state, and the wake command currently in flight.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let tunnel = &state.tunnel;

    let controller = tunnel.registry.current().await.map(|session| {
        json!({
            "session_id": session.id,
            "device_id": session.device_id,
            "connected_secs": session.connected_since.elapsed().as_secs(),
            "last_pong_age_ms": session.last_pong_age().as_millis() as u64,
            "probe_outstanding": session.probe_outstanding(),
        })
    });

    let command = tunnel.relay.in_flight().map(|c| {
        json!({
            "id": c.id,
            "mac": c.mac,
            "age_ms": c.age.as_millis() as u64,
            "remaining_ms": c.remaining.as_millis() as u64,
        })
    });

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "connected": controller.is_some(),
        "controller": controller,
        "command": command,
        "status_observers": tunnel.registry.status().observer_count(),
    }))
}
