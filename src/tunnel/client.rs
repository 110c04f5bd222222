//! Controller emulator: the device end of the tunnel.
//!
//! Runs under `wol-relay emulate`. Keeps an outbound WebSocket to the tunnel
//! listener with exponential-backoff reconnect, authenticates with a freshly
//! signed token on every connect, and answers wake commands by broadcasting a
//! magic packet. Ping frames are answered by the WebSocket layer while the
//! stream is being read.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use super::{Handshake, WakeCommand};
use crate::credential::{unix_now, CredentialValidator};
use crate::wol::{send_magic_packet, MacAddress};

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub url: String,
    pub device_id: String,
    pub secret: String,
    /// Where magic packets are sent.
    pub broadcast: SocketAddr,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
}

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Spawn the emulator task. Returns a `JoinHandle` that runs until cancelled.
pub fn spawn(config: EmulatorConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(emulator_loop(config))
}

/// Main loop: connect, handle commands, reconnect on failure.
pub async fn emulator_loop(config: EmulatorConfig) {
    let mut delay = config.reconnect_delay;

    loop {
        info!(url = %config.url, "Emulator: connecting to relay");
        match connect_and_run(&config).await {
            Ok(()) => {
                info!("Emulator: connection closed, reconnecting...");
                delay = config.reconnect_delay;
            }
            Err(e) => {
                warn!(
                    "Emulator: connection error: {e}, reconnecting in {}s",
                    delay.as_secs()
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
}

/// Build the handshake frame for `device_id` at time `now`.
pub fn handshake_message(
    validator: &CredentialValidator,
    device_id: &str,
    now: u64,
) -> Result<String, serde_json::Error> {
    let token = format!("{device_id}-{now}");
    let hmac = validator.sign(&token);
    serde_json::to_string(&Handshake {
        token: Some(token),
        hmac: Some(hmac),
    })
}

/// A single connection: handshake, then answer commands until disconnect.
async fn connect_and_run(config: &EmulatorConfig) -> Result<(), EmulatorError> {
    let (ws, _response) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let validator = CredentialValidator::new(&config.secret);
    let hello = handshake_message(&validator, &config.device_id, unix_now())?;
    sink.send(Message::Text(hello.into())).await?;
    info!(device_id = %config.device_id, "Emulator: handshake sent");

    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                let reply = handle_command(text.as_str(), config.broadcast).await;
                sink.send(Message::Text(reply.to_string().into())).await?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Execute one wake command and build the reply frame.
pub async fn handle_command(text: &str, broadcast: SocketAddr) -> Value {
    let command: WakeCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            warn!("Emulator: invalid command: {e}");
            return json!({"status": "error", "error": "invalid command"});
        }
    };

    let mac = match command.mac.parse::<MacAddress>() {
        Ok(mac) => mac,
        Err(e) => {
            return json!({"id": command.id, "status": "error", "error": e.to_string()});
        }
    };

    match send_magic_packet(&mac, broadcast).await {
        Ok(()) => {
            info!(%mac, "Emulator: magic packet sent");
            json!({"id": command.id, "status": "ok", "mac": mac.to_string()})
        }
        Err(e) => {
            warn!(%mac, "Emulator: failed to send magic packet: {e}");
            json!({"id": command.id, "status": "error", "error": e.to_string()})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{tunnel_router, TunnelState, TunnelTimings};
    use tokio::net::UdpSocket;

    #[test]
    fn handshake_message_validates() {
        let validator = CredentialValidator::new("s");
        let text = handshake_message(&validator, "esp32", 1_700_000_000).unwrap();
        let hs: Handshake = serde_json::from_str(&text).unwrap();
        let cred = validator
            .validate(&hs.token.unwrap(), &hs.hmac.unwrap(), 1_700_000_010)
            .unwrap();
        assert_eq!(cred.device_id, "esp32");
    }

    #[tokio::test]
    async fn command_sends_packet_and_echoes_id() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let reply = handle_command(r#"{"mac":"aa:bb:cc:dd:ee:ff","id":"c1"}"#, target).await;
        assert_eq!(
            reply,
            json!({"id": "c1", "status": "ok", "mac": "AA:BB:CC:DD:EE:FF"})
        );

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, crate::wol::MAGIC_PACKET_LEN);
    }

    /// Serve a tunnel listener on an ephemeral port.
    async fn serve_tunnel(timings: TunnelTimings) -> (TunnelState, SocketAddr) {
        let tunnel = TunnelState::new(CredentialValidator::new("e2e"), timings);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = tunnel_router(tunnel.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        });
        (tunnel, addr)
    }

    /// The relay must end the socket without sending any data frame.
    async fn assert_closed_silently<S>(stream: &mut S)
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match stream.next().await {
                    None | Some(Err(_) | Ok(Message::Close(_))) => return,
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(other)) => panic!("unexpected frame before close: {other:?}"),
                }
            }
        })
        .await
        .expect("socket was not closed");
    }

    #[tokio::test]
    async fn rejected_handshakes_close_without_attaching() {
        let (tunnel, addr) = serve_tunnel(TunnelTimings::default()).await;
        let validator = CredentialValidator::new("e2e");
        let now = unix_now();

        let bad_signature = serde_json::to_string(&Handshake {
            token: Some(format!("rogue-{now}")),
            hmac: Some("00".repeat(32)),
        })
        .unwrap();
        let expired = handshake_message(&validator, "stale", now - 3600).unwrap();
        let wrong_secret =
            handshake_message(&CredentialValidator::new("other"), "imposter", now).unwrap();

        for hello in [bad_signature, expired, wrong_secret, "not json".to_string()] {
            let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
                .await
                .unwrap();
            let (mut sink, mut stream) = ws.split();
            sink.send(Message::Text(hello.clone().into())).await.unwrap();
            assert_closed_silently(&mut stream).await;
            assert!(tunnel.registry.current().await.is_none(), "{hello}");
        }
        assert!(!tunnel.registry.is_connected());
    }

    #[tokio::test]
    async fn silent_socket_is_closed_after_auth_timeout() {
        let timings = TunnelTimings {
            auth_timeout: Duration::from_millis(200),
            ..TunnelTimings::default()
        };
        let (tunnel, addr) = serve_tunnel(timings).await;

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        let (_sink, mut stream) = ws.split();
        assert_closed_silently(&mut stream).await;
        assert!(tunnel.registry.current().await.is_none());
    }

    #[tokio::test]
    async fn emulator_wakes_through_real_tunnel_listener() {
        let (tunnel, addr) = serve_tunnel(TunnelTimings::default()).await;

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let emulator = spawn(EmulatorConfig {
            url: format!("ws://{addr}/"),
            device_id: "e2e-dev".into(),
            secret: "e2e".into(),
            broadcast: receiver.local_addr().unwrap(),
            reconnect_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
        });

        let mut status = tunnel.registry.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while status.next().await != Some(true) {}
        })
        .await
        .unwrap();
        let session = tunnel.registry.current().await.unwrap();
        assert_eq!(session.device_id, "e2e-dev");

        let reply = tunnel.relay.issue_wake("aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["mac"], "AA:BB:CC:DD:EE:FF");

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, crate::wol::MAGIC_PACKET_LEN);

        emulator.abort();
    }

    #[tokio::test]
    async fn bad_commands_get_error_replies() {
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let reply = handle_command("{]", target).await;
        assert_eq!(reply["status"], "error");

        let reply = handle_command(r#"{"mac":"nope","id":"c2"}"#, target).await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["id"], "c2");
    }
}
