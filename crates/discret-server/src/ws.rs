use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::StreamExt;
use futures::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::AppState;
use discret_core::access::Role;
use discret_core::realtime::RealtimeEvent;
use discret_shared::constants::{WS_IDLE_TIMEOUT_SECS, WS_PING_INTERVAL_SECS};
use discret_shared::types::{DeliveryId, UserId};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Authenticate {
        #[serde(rename = "userId")]
        user_id: UserId,
        role: Role,
    },
    #[serde(rename = "subscribe:delivery")]
    SubscribeDelivery {
        #[serde(rename = "deliveryId")]
        delivery_id: DeliveryId,
    },
    #[serde(rename = "unsubscribe:delivery")]
    UnsubscribeDelivery {
        #[serde(rename = "deliveryId")]
        delivery_id: DeliveryId,
    },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Event { event: RealtimeEvent },
    Authenticated { success: bool },
    Pong { timestamp: i64 },
}

/// One task per socket: client frames in, broadcaster feed out, keepalive
/// pings, idle cut-off. Closing deregisters the session and nothing else.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn_id, mut events) = state.broadcaster.connect().await;
    debug!(%conn_id, "realtime session opened");

    let (mut sender, mut receiver) = socket.split();
    let mut keepalive = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    keepalive.tick().await; // first tick fires immediately
    let idle_timeout = Duration::from_secs(WS_IDLE_TIMEOUT_SECS);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let frame = ServerMessage::Event { event };
                if send_json(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if handle_client_message(msg, conn_id, &state, &mut sender)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(%conn_id, error = %e, "unparseable realtime frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%conn_id, "realtime session closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%conn_id, error = %e, "realtime receive error");
                        break;
                    }
                }
            }

            _ = keepalive.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    info!(%conn_id, "realtime session idle, dropping");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broadcaster.disconnect(conn_id).await;
    debug!(%conn_id, "realtime session deregistered");
}

async fn handle_client_message(
    msg: ClientMessage,
    conn_id: uuid::Uuid,
    state: &AppState,
    sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
) -> Result<(), axum::Error> {
    match msg {
        ClientMessage::Authenticate { user_id, role } => {
            let success = state.broadcaster.authenticate(conn_id, user_id, role).await;
            send_json(sender, &ServerMessage::Authenticated { success }).await
        }
        ClientMessage::SubscribeDelivery { delivery_id } => {
            state.broadcaster.subscribe(conn_id, delivery_id).await;
            Ok(())
        }
        ClientMessage::UnsubscribeDelivery { delivery_id } => {
            state.broadcaster.unsubscribe(conn_id, delivery_id).await;
            Ok(())
        }
        ClientMessage::Ping => {
            send_json(
                sender,
                &ServerMessage::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                },
            )
            .await
        }
    }
}

async fn send_json(
    sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to encode realtime frame");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_names() {
        let auth: ClientMessage = serde_json::from_str(
            r#"{"type":"authenticate","userId":"7f8c8c64-7e46-4df3-9d5c-1f4f9c2a0b11","role":"driver"}"#,
        )
        .unwrap();
        assert!(matches!(auth, ClientMessage::Authenticate { role: Role::Driver, .. }));

        let sub: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe:delivery","deliveryId":"7f8c8c64-7e46-4df3-9d5c-1f4f9c2a0b11"}"#,
        )
        .unwrap();
        assert!(matches!(sub, ClientMessage::SubscribeDelivery { .. }));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_shape() {
        let json = serde_json::to_string(&ServerMessage::Authenticated { success: true }).unwrap();
        assert!(json.contains(r#""type":"authenticated""#));
        assert!(json.contains(r#""success":true"#));
    }
}
