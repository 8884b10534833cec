//! DirectEndpoint: the LAN-local WebSocket surface. Any device on the boat's
//! own network — a chartplotter app, a browser tab — connects here directly,
//! with no hub or signature handshake involved.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use relay_types::ClientMessage;
use tracing::{debug, info, warn};

use crate::coordinator::ClientSyncCoordinator;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u8 = 2;

struct DirectState {
    coordinator: Arc<ClientSyncCoordinator>,
    max_payload_bytes: usize,
}

pub fn router(coordinator: Arc<ClientSyncCoordinator>, max_payload_bytes: usize) -> Router {
    let state = Arc::new(DirectState { coordinator, max_payload_bytes });
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<DirectState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<DirectState>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let subscriber = state.coordinator.handle_client_connection(client_id.clone(), "direct").await;
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately, skip it
    let mut missed_pongs: u8 = 0;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    warn!("client {client_id} missed {MAX_MISSED_PONGS} consecutive heartbeats, closing");
                    break;
                }
                missed_pongs += 1;
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > state.max_payload_bytes {
                            warn!("client {client_id} sent a frame over the {}-byte limit, closing the connection", state.max_payload_bytes);
                            break;
                        }
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => state.coordinator.handle_client_message(&client_id, message).await,
                            Err(e) => debug!("client {client_id} sent an unparsable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("client {client_id} websocket error: {e}");
                        break;
                    }
                }
            }
            _ = subscriber.wait_for_outbound() => {
                for message in subscriber.drain().await {
                    let text = match serde_json::to_string(&message) {
                        Ok(t) => t,
                        Err(e) => { warn!("failed to encode outbound message for {client_id}: {e}"); continue; }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.coordinator.handle_client_disconnection(&client_id).await;
    info!("client {client_id} connection closed");
}
