//! The producer → StateManager event bus: a single typed `broadcast` channel
//! of a closed `ProducerEvent` enum, replacing the event-emitter-per-service
//! chains of the design this was distilled from.

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum ProducerEvent {
    PositionUpdate { lat: f64, lon: f64, source: String, timestamp_ms: i64 },
    WeatherUpdate { report: Value },
    WeatherError { message: String },
    TideUpdate { report: Value },
    TideError { message: String },
    DeviceDiscovered { device_id: String, name: String, manufacturer_id: u16 },
    DeviceUpdated { device_id: String, fields: Value },
    DeviceData { device_id: String, measurement: Value },
    ScanStart,
    ScanStop,
    ModbusData { register: String, value: Value },
    ModbusError { register: String, message: String },
    PlaybackPatch { ops: Vec<relay_types::PatchOp> },
    Error { producer: String, message: String },
}

pub type EventSender = tokio::sync::broadcast::Sender<ProducerEvent>;
pub type EventReceiver = tokio::sync::broadcast::Receiver<ProducerEvent>;

pub fn new_bus() -> EventSender {
    let (tx, _rx) = tokio::sync::broadcast::channel(256);
    tx
}
