//! # relay-types
//!
//! Shared wire protocol structures for the vessel telemetry relay.
//!
//! These types are used by:
//! - `vessel-relay`: the core relay binary, on both the LAN direct endpoint
//!   and the outbound hub connector
//! - any future tooling that needs to speak the same patch/message wire
//!   format without pulling in the full relay runtime
//!
//! ## Wire conventions
//!
//! - Frames are newline-free JSON objects tagged by a `type` field.
//! - Patch operations follow RFC 6902 (`add` / `replace` / `remove`) restricted
//!   to the subset the state document needs: no `move`, `copy`, or `test`.
//! - Paths are `/`-separated segments, first segment naming a top-level group.

use serde::{Deserialize, Serialize};

// ── Patch operations ──────────────────────────────────────────────────────────

/// A single RFC 6902-style mutation against the state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: serde_json::Value },
    Replace { path: String, value: serde_json::Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } => path,
            PatchOp::Replace { path, .. } => path,
            PatchOp::Remove { path } => path,
        }
    }

    /// First path segment, e.g. `/navigation/position` -> `navigation`.
    pub fn top_level_group(&self) -> &str {
        self.path().trim_start_matches('/').split('/').next().unwrap_or("")
    }
}

/// An ordered, atomically-applied sequence of [`PatchOp`]s, stamped once accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct top-level groups touched by this patch, used for subscription
    /// intersection and fan-out routing.
    pub fn touched_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.ops.iter().map(|op| op.top_level_group().to_string()).collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

// ── Measurement records ───────────────────────────────────────────────────────

/// A single timestamped scalar reading from a named source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: String,
}

// ── Priority / data type classification (SyncOrchestrator) ───────────────────

/// Throttling priority class used by the SyncOrchestrator's interval formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Vessel-mode throttling profile name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileName {
    #[default]
    Normal,
    HighSpeed,
    Anchored,
    PowerSaving,
}

/// Measured link health, smoothed by the hub connector's ping/pong loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkStatus {
    Good,
    Fair,
    Poor,
}

// ── Top-level client/server message envelopes ─────────────────────────────────

/// Messages a subscriber (local or, via the hub, remote) may send inbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "get-full-state")]
    GetFullState,
    #[serde(rename = "subscription")]
    Subscription { action: String, data: Vec<String> },
    #[serde(rename = "anchor:update")]
    AnchorUpdate { data: serde_json::Value },
    #[serde(rename = "alert:update")]
    AlertUpdate { data: serde_json::Value },
    #[serde(rename = "bluetooth:toggle")]
    BluetoothToggle { data: serde_json::Value },
    #[serde(rename = "bluetooth:scan")]
    BluetoothScan { data: serde_json::Value },
    #[serde(rename = "bluetooth:select-device")]
    BluetoothSelectDevice { data: serde_json::Value },
    #[serde(rename = "bluetooth:deselect-device")]
    BluetoothDeselectDevice { data: serde_json::Value },
    #[serde(rename = "bluetooth:rename-device")]
    BluetoothRenameDevice { data: serde_json::Value },
}

/// Messages the relay sends outbound to a subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "state:full-update")]
    FullUpdate { data: serde_json::Value, version: u64, timestamp: i64 },
    #[serde(rename = "state:patch")]
    StatePatch { data: Vec<PatchOp>, version: u64, timestamp: i64 },
    #[serde(rename = "tide:update")]
    TideUpdate { data: serde_json::Value },
    #[serde(rename = "weather:update")]
    WeatherUpdate { data: serde_json::Value },
    #[serde(rename = "anchor:update:ack")]
    AnchorAck { success: bool, detail: String },
    #[serde(rename = "alert:update:ack")]
    AlertAck { success: bool, detail: String },
    #[serde(rename = "bluetooth:response")]
    BluetoothResponse { success: bool, detail: String },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

// ── Hub handshake frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HubOutbound {
    #[serde(rename = "register")]
    Register { #[serde(rename = "boatIds")] boat_ids: Vec<String>, role: &'static str },
    #[serde(rename = "identity")]
    Identity { #[serde(rename = "boatId")] boat_id: String, role: &'static str, timestamp: i64, signature: String },
    #[serde(rename = "register-key")]
    RegisterKey { #[serde(rename = "boatId")] boat_id: String, #[serde(rename = "publicKey")] public_key: String, timestamp: i64 },
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    /// A reply or state update addressed to one remote client, relayed
    /// through the hub rather than sent over a direct socket.
    #[serde(rename = "relay")]
    Relay { #[serde(rename = "clientId")] client_id: String, message: ServerMessage },
    /// A state broadcast, not addressed to any one client. Mirrors
    /// `ServerMessage::StatePatch`'s shape so the hub's own subscribers see
    /// the same frame a direct LAN client would.
    #[serde(rename = "state:patch")]
    StatePatch { data: Vec<PatchOp>, version: u64, timestamp: i64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum HubInbound {
    #[serde(rename = "client-connected")]
    ClientConnected { #[serde(rename = "clientId")] client_id: String, #[serde(rename = "boatId")] boat_id: String },
    #[serde(rename = "client-disconnected")]
    ClientDisconnected { #[serde(rename = "clientId")] client_id: String },
    #[serde(rename = "connectionStatus")]
    ConnectionStatus { #[serde(rename = "boatId")] boat_id: String, #[serde(rename = "clientCount")] client_count: u32 },
    #[serde(rename = "pong")]
    Pong { echo: i64 },
    #[serde(rename = "get-full-state")]
    GetFullState { #[serde(rename = "requestId")] request_id: String, #[serde(rename = "clientId")] client_id: String },
    /// A command originally sent by a remote client, proxied by the hub with
    /// the client id attached so the reply can be relayed back to the right
    /// one.
    #[serde(rename = "command")]
    Command { #[serde(rename = "clientId")] client_id: String, command: ClientMessage },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touched_groups_dedup_and_sort() {
        let patch = Patch::new(vec![
            PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(5.0) },
            PatchOp::Add { path: "/navigation/heading".into(), value: serde_json::json!(90.0) },
            PatchOp::Remove { path: "/alerts/active/1".into() },
        ]);
        assert_eq!(patch.touched_groups(), vec!["alerts".to_string(), "navigation".to_string()]);
    }

    #[test]
    fn patch_op_round_trips_through_json() {
        let op = PatchOp::Add { path: "/anchor/deployed".into(), value: serde_json::json!(true) };
        let encoded = serde_json::to_string(&op).unwrap();
        let decoded: PatchOp = serde_json::from_str(&encoded).unwrap();
        assert_eq!(op, decoded);
    }
}
