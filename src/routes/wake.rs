//! `POST /wol`: relay a wake request to the attached controller.

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tunnel::relay::CommandError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WakeRequest {
    #[serde(default)]
    pub mac: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message, "code": "BAD_REQUEST"})),
    )
}

fn command_error(e: CommandError) -> ApiError {
    let (status, code) = match e {
        CommandError::NoController => (StatusCode::SERVICE_UNAVAILABLE, "NO_CONTROLLER"),
        CommandError::AlreadyInFlight => (StatusCode::CONFLICT, "ALREADY_IN_FLIGHT"),
        CommandError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        CommandError::ControllerDisconnected => (StatusCode::BAD_GATEWAY, "CONTROLLER_DISCONNECTED"),
        CommandError::InvalidControllerResponse => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INVALID_CONTROLLER_RESPONSE")
        }
    };
    (status, Json(json!({"error": e.to_string(), "code": code})))
}

/// `POST /wol`: body `{"mac": "<MAC>"}`.
///
/// A missing controller is reported before the body is looked at. On success
/// the controller's reply is returned as-is.
pub async fn wake(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    if !state.tunnel.registry.is_connected() {
        return Err(command_error(CommandError::NoController));
    }

    let request: WakeRequest =
        serde_json::from_slice(&body).map_err(|_| bad_request("Invalid JSON body"))?;
    let mac = request
        .mac
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| bad_request("MAC address required"))?;

    state
        .tunnel
        .relay
        .issue_wake(mac)
        .await
        .map(Json)
        .map_err(command_error)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::routes::operator_router;
    use crate::routes::test_support::{authed, test_state};
    use crate::tunnel::relay::ReplyDisposition;
    use crate::tunnel::session::ControllerSession;
    use crate::AppState;

    async fn post_wol(state: &AppState, body: &'static str) -> (StatusCode, Value) {
        let response = operator_router(state.clone())
            .oneshot(authed(state, "POST", "/wol", Body::from(body)))
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn requires_session() {
        let response = operator_router(test_state())
            .oneshot(
                Request::post("/wol")
                    .body(Body::from(r#"{"mac":"AA:BB:CC:DD:EE:FF"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn no_controller_is_503_before_body_check() {
        let state = test_state();
        let (status, body) = post_wol(&state, "not json").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "NO_CONTROLLER");
    }

    #[tokio::test]
    async fn malformed_or_empty_mac_is_400() {
        let state = test_state();
        let (session, _channels) = ControllerSession::new(1, "esp32");
        state.tunnel.registry.attach(Arc::new(session)).await;

        for body in ["not json", "{}", r#"{"mac":"  "}"#, r#"{"mac":null}"#] {
            let (status, _) = post_wol(&state, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        }
        assert!(state.tunnel.relay.in_flight().is_none());
    }

    #[tokio::test]
    async fn reply_is_returned_verbatim() {
        let state = test_state();
        let (session, mut channels) = ControllerSession::new(1, "esp32");
        state.tunnel.registry.attach(Arc::new(session)).await;

        let controller = {
            let relay = state.tunnel.relay.clone();
            tokio::spawn(async move {
                let sent = channels.outbound_rx.recv().await.unwrap();
                let command: Value = serde_json::from_str(&sent).unwrap();
                assert_eq!(command["mac"], "AA:BB:CC:DD:EE:FF");
                let reply = json!({"id": command["id"], "status": "ok", "note": "woken"});
                assert_eq!(
                    relay.accept_reply(1, &reply.to_string()),
                    ReplyDisposition::Resolved
                );
                channels
            })
        };

        let (status, body) = post_wol(&state, r#"{"mac":"AA:BB:CC:DD:EE:FF"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["note"], "woken");
        controller.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_request_is_409() {
        let state = test_state();
        let (session, mut channels) = ControllerSession::new(1, "esp32");
        state.tunnel.registry.attach(Arc::new(session)).await;

        let first = {
            let state = state.clone();
            tokio::spawn(async move { post_wol(&state, r#"{"mac":"AA:BB:CC:DD:EE:01"}"#).await })
        };
        let sent = channels.outbound_rx.recv().await.unwrap();

        let (status, body) = post_wol(&state, r#"{"mac":"AA:BB:CC:DD:EE:02"}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_IN_FLIGHT");

        state.tunnel.relay.accept_reply(1, &sent);
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_is_504() {
        let state = test_state();
        let (session, _channels) = ControllerSession::new(1, "esp32");
        state.tunnel.registry.attach(Arc::new(session)).await;

        let (status, body) = post_wol(&state, r#"{"mac":"AA:BB:CC:DD:EE:FF"}"#).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "TIMEOUT");
        assert!(state.tunnel.relay.in_flight().is_none());
    }

    #[tokio::test]
    async fn controller_loss_is_502() {
        let state = test_state();
        let (session, mut channels) = ControllerSession::new(1, "esp32");
        state.tunnel.registry.attach(Arc::new(session)).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { post_wol(&state, r#"{"mac":"AA:BB:CC:DD:EE:FF"}"#).await })
        };
        channels.outbound_rx.recv().await.unwrap();
        assert!(state.tunnel.relay.abandon(1));

        let (status, body) = waiter.await.unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "CONTROLLER_DISCONNECTED");
    }

    #[tokio::test]
    async fn non_json_reply_is_500() {
        let state = test_state();
        let (session, mut channels) = ControllerSession::new(1, "esp32");
        state.tunnel.registry.attach(Arc::new(session)).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { post_wol(&state, r#"{"mac":"AA:BB:CC:DD:EE:FF"}"#).await })
        };
        channels.outbound_rx.recv().await.unwrap();
        state.tunnel.relay.accept_reply(1, "definitely not json");

        let (status, body) = waiter.await.unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "INVALID_CONTROLLER_RESPONSE");
    }
}
