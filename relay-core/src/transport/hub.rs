//! HubConnector: the outbound WebSocket client that registers this vessel
//! with a remote hub so off-boat clients can reach it without a direct LAN
//! connection. Owns one persistent connection, a bounded disconnect buffer,
//! and a state machine driving reconnect/backoff.
//!
//! Grounded on the writer-half-behind-a-mutex-plus-recursive-reconnect shape
//! used for the multi-connection market feed manager this pack also carries,
//! scaled down to the one-connection case this relay needs: `current_writer`
//! plays the role that pack's per-connection `writer: Arc<Mutex<Option<..>>>`
//! plays, shared across reconnects instead of rebuilt per attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_types::{ClientMessage, HubInbound, HubOutbound, LinkStatus, PatchOp};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::coordinator::ClientSyncCoordinator;
use crate::error::RelayError;
use crate::events::EventSender;
use crate::identity::IdentityCredential;
use crate::orchestrator::SyncOrchestrator;
use crate::producers::Producer;
use crate::store::PatchEvent;

const DISCONNECT_BUFFER_CAPACITY: usize = 100;
const RELAY_ROLE: &str = "boat-server";
/// Top-level groups still forwarded to the hub when it reports zero remote
/// clients connected.
const ALLOWED_WHEN_IDLE: &[&str] = &["anchor"];

type HubWriter = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct HubConnector {
    url: String,
    identity: Arc<IdentityCredential>,
    coordinator: Arc<ClientSyncCoordinator>,
    orchestrator: Arc<SyncOrchestrator>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    ping_interval: Duration,
    connection_timeout: Duration,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    client_count: Arc<AtomicU32>,
    current_writer: Arc<Mutex<Option<HubWriter>>>,
    /// Frames that could not be written immediately because the hub link was
    /// down. Flushed in order as soon as a new connection is live.
    buffer: Arc<Mutex<VecDeque<HubOutbound>>>,
}

impl HubConnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        identity: Arc<IdentityCredential>,
        coordinator: Arc<ClientSyncCoordinator>,
        orchestrator: Arc<SyncOrchestrator>,
        reconnect_interval: Duration,
        max_reconnect_attempts: u32,
        ping_interval: Duration,
        connection_timeout: Duration,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            url,
            identity,
            coordinator,
            orchestrator,
            reconnect_interval,
            max_reconnect_attempts,
            ping_interval,
            connection_timeout,
            ready_tx,
            ready_rx,
            client_count: Arc::new(AtomicU32::new(0)),
            current_writer: Arc::new(Mutex::new(None)),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.connect_and_serve(&mut shutdown).await {
                Ok(()) => return, // clean shutdown requested mid-session
                Err(e) => warn!("hub connection lost: {e}"),
            }
            *self.current_writer.lock().await = None;

            if *shutdown.borrow() {
                return;
            }
            attempt += 1;
            if attempt > self.max_reconnect_attempts {
                error!("hub connector giving up after {attempt} failed attempts, running LAN-only");
                let _ = self.ready_tx.send(true);
                return;
            }

            tokio::select! {
                _ = shutdown.changed() => if *shutdown.borrow() { return; },
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }

    async fn connect_and_serve(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RelayError> {
        let (ws, _response) = tokio::time::timeout(self.connection_timeout, tokio_tungstenite::connect_async(&self.url))
            .await
            .map_err(|_| RelayError::Timeout(format!("connecting to hub at {}", self.url)))?
            .map_err(|e| RelayError::Transport(format!("hub connect failed: {e}")))?;

        info!("connected to hub at {}", self.url);
        let (write, mut read) = ws.split();
        *self.current_writer.lock().await = Some(write);

        self.send_identity().await?;
        self.flush_buffer().await;
        let _ = self.ready_tx.send(true);

        let mut ping_tick = tokio::time::interval(self.ping_interval);
        ping_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = self.write_now(&HubOutbound::Ping { timestamp: now_ms() }).await;
                        return Ok(());
                    }
                }
                _ = ping_tick.tick() => {
                    if self.write_now(&HubOutbound::Ping { timestamp: now_ms() }).await.is_err() {
                        return Err(RelayError::Transport("hub write failed on ping".into()));
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(RelayError::Transport("hub closed the connection".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(RelayError::Transport(format!("hub read error: {e}"))),
                    }
                }
            }
        }
    }

    async fn send_identity(&self) -> Result<(), RelayError> {
        let timestamp = now_ms();
        let signature = self.identity.sign_identity(timestamp);
        self.write_now(&HubOutbound::Register { boat_ids: vec![self.identity.boat_id.clone()], role: RELAY_ROLE })
            .await
            .map_err(|_| RelayError::Transport("failed to send hub registration frame".into()))?;
        self.write_now(&HubOutbound::Identity { boat_id: self.identity.boat_id.clone(), role: RELAY_ROLE, timestamp, signature })
            .await
            .map_err(|_| RelayError::Auth("failed to send identity handshake".into()))?;
        self.write_now(&HubOutbound::RegisterKey {
            boat_id: self.identity.boat_id.clone(),
            public_key: self.identity.public_key_pem().to_string(),
            timestamp,
        })
        .await
        .map_err(|_| RelayError::Auth("failed to register public key".into()))
    }

    async fn handle_inbound(&self, text: &str) {
        let message = match serde_json::from_str::<HubInbound>(text) {
            Ok(m) => m,
            Err(e) => {
                debug!("unparsable hub frame: {e}");
                return;
            }
        };

        match message {
            HubInbound::ClientConnected { client_id, boat_id } => {
                if boat_id != self.identity.boat_id {
                    return;
                }
                self.client_count.fetch_add(1, Ordering::Relaxed);
                let subscriber = self.coordinator.handle_client_connection(client_id.clone(), "hub").await;
                let writer = self.current_writer.clone();
                let buffer = self.buffer.clone();
                tokio::spawn(async move {
                    loop {
                        subscriber.wait_for_outbound().await;
                        for message in subscriber.drain().await {
                            let frame = HubOutbound::Relay { client_id: client_id.clone(), message };
                            if write_or_buffer(&writer, &buffer, frame).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
            HubInbound::ClientDisconnected { client_id } => {
                self.client_count.fetch_sub(1, Ordering::Relaxed);
                self.coordinator.handle_client_disconnection(&client_id).await;
            }
            HubInbound::ConnectionStatus { boat_id, client_count } => {
                if boat_id == self.identity.boat_id {
                    self.client_count.store(client_count, Ordering::Relaxed);
                }
            }
            HubInbound::Pong { .. } => {
                self.orchestrator.set_link_status(LinkStatus::Good).await;
            }
            HubInbound::GetFullState { client_id, .. } => {
                self.coordinator.handle_client_message(&client_id, ClientMessage::GetFullState).await;
            }
            HubInbound::Command { client_id, command } => {
                self.coordinator.handle_client_message(&client_id, command).await;
            }
        }
    }

    /// Writes one frame now if a connection is live, otherwise buffers it.
    async fn write_now(&self, frame: &HubOutbound) -> Result<(), ()> {
        write_or_buffer(&self.current_writer, &self.buffer, frame.clone()).await
    }

    async fn flush_buffer(&self) {
        loop {
            let frame = { self.buffer.lock().await.pop_front() };
            let Some(frame) = frame else { return };
            if write_direct(&self.current_writer, &frame).await.is_err() {
                self.buffer.lock().await.push_front(frame);
                return;
            }
        }
    }

    /// Always-on state broadcast to the hub, independent of the per-client
    /// relay loops spawned on `ClientConnected`. Runs for the lifetime of the
    /// connector, across reconnects, since `write_or_buffer` already queues
    /// frames while the link is down.
    async fn forward_state(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut patches = self.coordinator.subscribe_patches().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = patches.recv() => {
                    match event {
                        Ok(event) => self.forward_patch_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("hub forwarder lagged behind state store by {n} events");
                        }
                    }
                }
            }
        }
    }

    /// §4.7 outbound suppression: with zero remote clients connected, only
    /// allow-listed groups (currently just `anchor`) are still forwarded.
    async fn forward_patch_event(&self, event: PatchEvent) {
        let idle = self.client_count.load(Ordering::Relaxed) == 0;
        let ops = suppress_when_idle(event.ops, idle);
        if ops.is_empty() {
            return;
        }
        let frame = HubOutbound::StatePatch { data: ops, version: event.version, timestamp: event.timestamp_ms };
        let _ = write_or_buffer(&self.current_writer, &self.buffer, frame).await;
    }
}

fn suppress_when_idle(ops: Vec<PatchOp>, idle: bool) -> Vec<PatchOp> {
    ops.into_iter().filter(|op| !idle || ALLOWED_WHEN_IDLE.contains(&op.top_level_group())).collect()
}

async fn write_direct(writer: &Arc<Mutex<Option<HubWriter>>>, frame: &HubOutbound) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(w) => w.send(Message::Text(text.into())).await.map_err(|_| ()),
        None => Err(()),
    }
}

/// Writes now, or buffers (dropping the oldest on overflow) when the link is
/// down — the mechanism behind "flush-on-reconnect".
async fn write_or_buffer(writer: &Arc<Mutex<Option<HubWriter>>>, buffer: &Arc<Mutex<VecDeque<HubOutbound>>>, frame: HubOutbound) -> Result<(), ()> {
    if writer.lock().await.is_some() {
        if write_direct(writer, &frame).await.is_ok() {
            return Ok(());
        }
    }
    let mut buffer = buffer.lock().await;
    if buffer.len() >= DISCONNECT_BUFFER_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(frame);
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Producer for HubConnector {
    fn name(&self) -> &'static str {
        "hub-connector"
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    fn spawn(self: Box<Self>, _events: EventSender, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let connector: Arc<Self> = Arc::from(self);
        tokio::spawn(connector.clone().forward_state(shutdown.clone()));
        tokio::spawn(connector.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffers_frame_when_no_writer_is_live() {
        let writer: Arc<Mutex<Option<HubWriter>>> = Arc::new(Mutex::new(None));
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        write_or_buffer(&writer, &buffer, HubOutbound::Ping { timestamp: 1 }).await.unwrap();
        assert_eq!(buffer.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn buffer_evicts_oldest_past_capacity() {
        let writer: Arc<Mutex<Option<HubWriter>>> = Arc::new(Mutex::new(None));
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        for i in 0..DISCONNECT_BUFFER_CAPACITY + 5 {
            write_or_buffer(&writer, &buffer, HubOutbound::Ping { timestamp: i as i64 }).await.unwrap();
        }
        assert_eq!(buffer.lock().await.len(), DISCONNECT_BUFFER_CAPACITY);
    }

    #[test]
    fn idle_hub_drops_everything_but_the_allow_list() {
        let ops = vec![
            PatchOp::Replace { path: "/navigation/speedOverGround".into(), value: serde_json::json!(5.2) },
            PatchOp::Replace { path: "/anchor/deployed".into(), value: serde_json::json!(true) },
        ];
        let kept = suppress_when_idle(ops, true);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].top_level_group(), "anchor");
    }

    #[test]
    fn non_idle_hub_forwards_every_group() {
        let ops = vec![
            PatchOp::Replace { path: "/navigation/speedOverGround".into(), value: serde_json::json!(5.2) },
            PatchOp::Replace { path: "/anchor/deployed".into(), value: serde_json::json!(true) },
        ];
        let kept = suppress_when_idle(ops, false);
        assert_eq!(kept.len(), 2);
    }
}
