//! StateManager: the pure mediator between producers and the state store.
//! Keeps no primary state of its own — only the rule engine's need for the
//! latest document, which it reads back from the store after every accepted
//! patch. Translates each producer event to one or more patches, and
//! exposes one command handler per known command kind.

use std::sync::Arc;

use relay_types::{Patch, PatchOp};
use serde_json::json;
use tracing::{error, warn};

use crate::events::{EventReceiver, ProducerEvent};
use crate::error::RelayError;
use crate::rules::RULES;
use crate::store::StateStore;

pub struct CommandResult {
    pub success: bool,
    pub detail: String,
}

pub struct StateManager {
    store: Arc<StateStore>,
}

impl StateManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    /// Seeds the document groups the invariants and rule engine assume
    /// exist (`alerts.active`/`alerts.resolved` as arrays, `anchor` and
    /// `bluetooth.devices` as objects), before any producer starts.
    pub async fn bootstrap(&self) -> Result<(), RelayError> {
        self.store
            .apply_patch(Patch::new(vec![
                PatchOp::Add { path: "/alerts".into(), value: json!({"active": [], "resolved": []}) },
                PatchOp::Add { path: "/anchor".into(), value: json!({"deployed": false, "location": null}) },
                PatchOp::Add { path: "/bluetooth".into(), value: json!({"devices": {}}) },
            ]))
            .await?;
        Ok(())
    }

    /// Attaches to a producer's event stream; translates each event into a
    /// patch and applies it, then runs the rule engine's single bounded
    /// second pass.
    pub async fn listen_to_service(&self, mut events: EventReceiver) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(patch) = translate_event(event) {
                        self.apply_and_run_rules(patch).await;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("state manager lagged behind producer event bus by {n} events");
                }
            }
        }
    }

    async fn apply_and_run_rules(&self, patch: Patch) {
        match self.store.apply_patch(patch).await {
            Ok(result) if result.accepted && !result.emitted.is_empty() => {
                let (document, _) = self.store.snapshot().await;
                let mut rule_ops = Vec::new();
                for rule in RULES {
                    rule_ops.extend(rule(&document, &result.emitted));
                }
                if !rule_ops.is_empty() {
                    if let Err(e) = self.store.apply_patch(Patch::new(rule_ops)).await {
                        error!("rule-engine patch rejected: {e}");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("patch from producer rejected: {e}"),
        }
    }

    pub async fn handle_anchor_update(&self, data: serde_json::Value) -> CommandResult {
        let mut ops = Vec::new();
        if let Some(deployed) = data.get("deployed") {
            ops.push(PatchOp::Replace { path: "/anchor/deployed".into(), value: deployed.clone() });
        }
        if let Some(location) = data.get("location") {
            ops.push(PatchOp::Replace { path: "/anchor/location".into(), value: location.clone() });
        }
        if let Some(range) = data.get("criticalRange") {
            ops.push(PatchOp::Replace { path: "/anchor/criticalRange".into(), value: range.clone() });
        }
        self.apply_command_patch(ops).await
    }

    pub async fn handle_alert_update(&self, data: serde_json::Value) -> CommandResult {
        let ops = vec![PatchOp::Replace { path: "/alerts".into(), value: data }];
        self.apply_command_patch(ops).await
    }

    pub async fn handle_bluetooth_toggle(&self, device_id: &str, enabled: bool) -> CommandResult {
        self.apply_command_patch(vec![PatchOp::Replace {
            path: format!("/bluetooth/devices/{device_id}/enabled"),
            value: json!(enabled),
        }])
        .await
    }

    pub async fn handle_bluetooth_select(&self, device_id: &str, selected: bool) -> CommandResult {
        self.apply_command_patch(vec![PatchOp::Replace {
            path: format!("/bluetooth/devices/{device_id}/selected"),
            value: json!(selected),
        }])
        .await
    }

    pub async fn handle_bluetooth_rename(&self, device_id: &str, name: String) -> CommandResult {
        self.apply_command_patch(vec![PatchOp::Replace {
            path: format!("/bluetooth/devices/{device_id}/name"),
            value: json!(name),
        }])
        .await
    }

    async fn apply_command_patch(&self, ops: Vec<PatchOp>) -> CommandResult {
        match self.store.apply_patch(Patch::new(ops)).await {
            Ok(result) => CommandResult { success: true, detail: format!("applied at version {}", result.version) },
            Err(e) => CommandResult { success: false, detail: e.to_string() },
        }
    }
}

fn translate_event(event: ProducerEvent) -> Option<Patch> {
    match event {
        // `add` rather than `replace`: these group paths don't exist until
        // the first reading arrives, and `add` auto-vivifies the
        // intermediate `navigation`/`environment` objects the same way it
        // does for a brand-new bluetooth device record below. `add` against
        // an existing key overwrites it, so this is safe on every later call
        // too.
        ProducerEvent::PositionUpdate { lat, lon, source, timestamp_ms } => Some(Patch::new(vec![PatchOp::Add {
            path: "/navigation/position".into(),
            value: json!({"value": {"lat": lat, "lon": lon}, "units": "deg", "timestamp": timestamp_ms, "source": source}),
        }])),
        ProducerEvent::WeatherUpdate { report } => Some(Patch::new(vec![PatchOp::Add { path: "/environment/weather".into(), value: report }])),
        ProducerEvent::TideUpdate { report } => Some(Patch::new(vec![PatchOp::Add { path: "/environment/tides".into(), value: report }])),
        ProducerEvent::DeviceDiscovered { device_id, name, manufacturer_id } => Some(Patch::new(vec![PatchOp::Add {
            path: format!("/bluetooth/devices/{device_id}"),
            value: json!({"name": name, "manufacturerId": manufacturer_id, "selected": false, "sensorData": {}}),
        }])),
        ProducerEvent::DeviceUpdated { device_id, fields } => Some(Patch::new(
            fields
                .as_object()?
                .iter()
                .map(|(k, v)| PatchOp::Replace { path: format!("/bluetooth/devices/{device_id}/{k}"), value: v.clone() })
                .collect(),
        )),
        ProducerEvent::DeviceData { device_id, measurement } => Some(Patch::new(vec![PatchOp::Replace {
            path: format!("/bluetooth/devices/{device_id}/sensorData"),
            value: measurement,
        }])),
        ProducerEvent::ModbusData { register, value } => Some(Patch::new(vec![PatchOp::Add { path: register, value }])),
        ProducerEvent::PlaybackPatch { ops } => Some(Patch::new(ops)),
        ProducerEvent::WeatherError { .. }
        | ProducerEvent::TideError { .. }
        | ProducerEvent::ModbusError { .. }
        | ProducerEvent::ScanStart
        | ProducerEvent::ScanStop
        | ProducerEvent::Error { .. } => None,
    }
}
