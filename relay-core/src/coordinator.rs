//! ClientSyncCoordinator: the single point of contact between transports
//! (the LAN direct endpoint and the hub connector) and the core state. Each
//! connected party — a LAN browser tab or a remote client proxied through
//! the hub — is represented here as a `Subscriber`, regardless of which
//! transport carries its bytes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_types::{ClientMessage, PatchOp, Priority, ServerMessage};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use crate::manager::{CommandResult, StateManager};
use crate::orchestrator::{PublishDecision, SyncOrchestrator};
use crate::store::PatchEvent;

const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Maps a touched document group to the orchestrator data type and priority
/// class it is throttled under.
fn classify(group: &str) -> (&'static str, Priority) {
    match group {
        "alerts" | "anchor" => ("alerts", Priority::High),
        "navigation" => ("navigation", Priority::Normal),
        "environment" => ("environment", Priority::Low),
        "bluetooth" => ("bluetooth", Priority::Normal),
        _ => ("default", Priority::Normal),
    }
}

pub struct Subscriber {
    pub id: String,
    pub transport: &'static str,
    pub subscriptions: RwLock<HashSet<String>>,
    pub backpressure: AtomicU64,
    queue: Mutex<std::collections::VecDeque<ServerMessage>>,
    notify: tokio::sync::Notify,
}

impl Subscriber {
    fn new(id: String, transport: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            subscriptions: RwLock::new(HashSet::new()),
            backpressure: AtomicU64::new(0),
            queue: Mutex::new(std::collections::VecDeque::new()),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Enqueues an outbound frame. A full queue drops the oldest
    /// non-`FullUpdate` entry (FIFO eviction) and records the drop.
    async fn enqueue(&self, message: ServerMessage) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= DEFAULT_QUEUE_CAPACITY {
            let evict_at = queue.iter().position(|m| !matches!(m, ServerMessage::FullUpdate { .. }));
            match evict_at {
                Some(idx) => {
                    queue.remove(idx);
                }
                None => {
                    queue.pop_front();
                }
            }
            self.backpressure.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        self.notify.notify_one();
    }

    /// Drains everything currently queued. Used by a transport's writer loop.
    pub async fn drain(&self) -> Vec<ServerMessage> {
        let mut queue = self.queue.lock().await;
        queue.drain(..).collect()
    }

    pub async fn wait_for_outbound(&self) {
        self.notify.notified().await;
    }
}

pub struct ClientSyncCoordinator {
    manager: Arc<StateManager>,
    orchestrator: Arc<SyncOrchestrator>,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl ClientSyncCoordinator {
    pub fn new(manager: Arc<StateManager>, orchestrator: Arc<SyncOrchestrator>) -> Arc<Self> {
        Arc::new(Self { manager, orchestrator, subscribers: RwLock::new(HashMap::new()) })
    }

    /// Registers a new subscriber and sends it the initial full snapshot.
    /// The snapshot is taken and the subscriber registered as a single
    /// operation so no patch accepted between snapshot and registration can
    /// be missed.
    pub async fn handle_client_connection(self: &Arc<Self>, client_id: String, transport: &'static str) -> Arc<Subscriber> {
        let subscriber = Subscriber::new(client_id.clone(), transport);
        let (snapshot, version, mut patch_rx) = self.manager.store().subscribe().await;
        self.subscribers.write().await.insert(client_id.clone(), subscriber.clone());

        subscriber
            .enqueue(ServerMessage::FullUpdate { data: snapshot, version, timestamp: now_ms() })
            .await;

        let fan_out_subscriber = subscriber.clone();
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                match patch_rx.recv().await {
                    Ok(event) => coordinator.fan_out_to(&fan_out_subscriber, event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("subscriber {} lagged behind state store by {n} events", fan_out_subscriber.id);
                    }
                }
            }
        });

        debug!("client {client_id} connected over {transport}");
        subscriber
    }

    pub async fn handle_client_disconnection(&self, client_id: &str) {
        self.subscribers.write().await.remove(client_id);
        self.orchestrator.drop_subscriber(client_id);
        debug!("client {client_id} disconnected");
    }

    /// Applies the orchestrator's per-subscriber throttling policy to one
    /// patch event, op by op so each path's data type/priority is evaluated
    /// independently. A coalesced op schedules its own one-shot flush so a
    /// subscriber that goes quiet still sees the latest value once its
    /// throttle window closes, instead of the value being stranded in the
    /// pending buffer forever.
    async fn fan_out_to(&self, subscriber: &Arc<Subscriber>, event: PatchEvent) {
        let subscriptions = subscriber.subscriptions.read().await;
        let restricted = !subscriptions.is_empty();

        let mut send_now_ops: Vec<PatchOp> = Vec::new();
        for op in &event.ops {
            let group = op.top_level_group().to_string();
            if restricted && !subscriptions.contains(&group) {
                continue;
            }
            let (data_type, priority) = classify(&group);
            match self
                .orchestrator
                .publish(&subscriber.id, data_type, priority, op.clone(), event.version, event.timestamp_ms)
                .await
            {
                PublishDecision::SendNow(mut ops) => send_now_ops.append(&mut ops),
                PublishDecision::Coalesced { flush_after: Some(delay) } => {
                    self.schedule_flush(subscriber.clone(), data_type, delay);
                }
                PublishDecision::Coalesced { flush_after: None } => {}
            }
        }
        drop(subscriptions);

        if !send_now_ops.is_empty() {
            subscriber
                .enqueue(ServerMessage::StatePatch { data: send_now_ops, version: event.version, timestamp: event.timestamp_ms })
                .await;
        }
    }

    /// One-shot timer that drains whatever is still pending for
    /// `(subscriber, data_type)` once its throttle window elapses.
    fn schedule_flush(&self, subscriber: Arc<Subscriber>, data_type: &'static str, delay: Duration) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((ops, version, timestamp_ms)) = orchestrator.take_pending(&subscriber.id, data_type).await {
                subscriber.enqueue(ServerMessage::StatePatch { data: ops, version, timestamp: timestamp_ms }).await;
            }
        });
    }

    /// Routes one inbound client frame to the appropriate StateManager
    /// command handler (or answers locally for protocol-level messages like
    /// ping/subscription) and enqueues the reply onto the subscriber's own
    /// outgoing queue.
    pub async fn handle_client_message(&self, client_id: &str, message: ClientMessage) {
        let subscriber = match self.subscribers.read().await.get(client_id).cloned() {
            Some(s) => s,
            None => {
                warn!("message from unregistered client {client_id}");
                return;
            }
        };

        match message {
            ClientMessage::Ping { timestamp } => {
                subscriber.enqueue(ServerMessage::Pong { timestamp }).await;
            }
            ClientMessage::GetFullState => {
                let (snapshot, version) = self.manager.store().snapshot().await;
                subscriber.enqueue(ServerMessage::FullUpdate { data: snapshot, version, timestamp: now_ms() }).await;
            }
            ClientMessage::Subscription { action, data } => {
                let mut subscriptions = subscriber.subscriptions.write().await;
                match action.as_str() {
                    "subscribe" => subscriptions.extend(data),
                    "unsubscribe" => {
                        for group in &data {
                            subscriptions.remove(group);
                        }
                    }
                    "update" => *subscriptions = data.into_iter().collect(),
                    other => warn!("unknown subscription action {other} from {client_id}"),
                }
            }
            ClientMessage::AnchorUpdate { data } => {
                let result = self.manager.handle_anchor_update(data).await;
                self.ack(&subscriber, ServerMessage::AnchorAck { success: result.success, detail: result.detail }).await;
            }
            ClientMessage::AlertUpdate { data } => {
                let result = self.manager.handle_alert_update(data).await;
                self.ack(&subscriber, ServerMessage::AlertAck { success: result.success, detail: result.detail }).await;
            }
            ClientMessage::BluetoothToggle { data } => {
                let result = self.dispatch_bluetooth_toggle(data).await;
                self.ack_bluetooth(&subscriber, result).await;
            }
            ClientMessage::BluetoothSelectDevice { data } => {
                let result = self.dispatch_bluetooth_select(data, true).await;
                self.ack_bluetooth(&subscriber, result).await;
            }
            ClientMessage::BluetoothDeselectDevice { data } => {
                let result = self.dispatch_bluetooth_select(data, false).await;
                self.ack_bluetooth(&subscriber, result).await;
            }
            ClientMessage::BluetoothRenameDevice { data } => {
                let result = self.dispatch_bluetooth_rename(data).await;
                self.ack_bluetooth(&subscriber, result).await;
            }
            ClientMessage::BluetoothScan { .. } => {
                // Scan start/stop is driven by the bluetooth producer directly;
                // acknowledged here so clients get a response on the same socket.
                self.ack_bluetooth(&subscriber, CommandResult { success: true, detail: "scan request noted".into() }).await;
            }
        }
    }

    async fn ack(&self, subscriber: &Subscriber, message: ServerMessage) {
        subscriber.enqueue(message).await;
    }

    async fn ack_bluetooth(&self, subscriber: &Subscriber, result: CommandResult) {
        subscriber.enqueue(ServerMessage::BluetoothResponse { success: result.success, detail: result.detail }).await;
    }

    async fn dispatch_bluetooth_toggle(&self, data: serde_json::Value) -> CommandResult {
        let device_id = data.get("deviceId").and_then(|v| v.as_str()).unwrap_or_default();
        let enabled = data.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
        self.manager.handle_bluetooth_toggle(device_id, enabled).await
    }

    async fn dispatch_bluetooth_select(&self, data: serde_json::Value, selected: bool) -> CommandResult {
        let device_id = data.get("deviceId").and_then(|v| v.as_str()).unwrap_or_default();
        self.manager.handle_bluetooth_select(device_id, selected).await
    }

    async fn dispatch_bluetooth_rename(&self, data: serde_json::Value) -> CommandResult {
        let device_id = data.get("deviceId").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let name = data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        self.manager.handle_bluetooth_rename(&device_id, name).await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Raw patch feed for consumers that broadcast state themselves instead
    /// of going through a per-subscriber `Subscriber` queue — the hub
    /// connector's always-on forward path, which applies its own zero-client
    /// suppression rather than per-subscriber throttling.
    pub async fn subscribe_patches(&self) -> broadcast::Receiver<PatchEvent> {
        let (_, _, rx) = self.manager.store().subscribe().await;
        rx
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_alerts_as_high_priority() {
        let (data_type, priority) = classify("alerts");
        assert_eq!(data_type, "alerts");
        assert_eq!(priority, Priority::High);
    }

    #[tokio::test]
    async fn subscriber_queue_evicts_oldest_non_snapshot_on_overflow() {
        let subscriber = Subscriber::new("sub-1".into(), "direct");
        for i in 0..DEFAULT_QUEUE_CAPACITY {
            subscriber.enqueue(ServerMessage::Pong { timestamp: i as i64 }).await;
        }
        subscriber.enqueue(ServerMessage::Pong { timestamp: 9999 }).await;
        assert_eq!(subscriber.backpressure.load(Ordering::Relaxed), 1);
        let drained = subscriber.drain().await;
        assert_eq!(drained.len(), DEFAULT_QUEUE_CAPACITY);
    }
}
