//! Bluetooth producer: scans advertisement frames delivered by an adapter
//! and parses vendor-specific payloads through a `ParserRegistry` keyed by
//! manufacturer id. The adapter itself (the actual BLE radio / OS stack) is
//! an external collaborator; this producer only owns the scan lifecycle,
//! dedup/debounce bookkeeping, and the parser dispatch.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::{EventSender, ProducerEvent};
use crate::producers::Producer;

#[derive(Debug, Clone)]
pub struct AdvertisementFrame {
    pub device_id: String,
    pub name: String,
    pub manufacturer_id: u16,
    pub payload: Vec<u8>,
}

/// Parses a manufacturer-specific payload into sensor measurement JSON.
/// Registered per manufacturer id; unknown ids are ignored.
pub type Parser = Box<dyn Fn(&[u8]) -> Option<Value> + Send + Sync>;

#[derive(Default)]
pub struct ParserRegistry {
    parsers: HashMap<u16, Parser>,
}

impl ParserRegistry {
    pub fn register(&mut self, manufacturer_id: u16, parser: Parser) {
        self.parsers.insert(manufacturer_id, parser);
    }

    pub fn parse(&self, manufacturer_id: u16, payload: &[u8]) -> Option<Value> {
        self.parsers.get(&manufacturer_id).and_then(|p| p(payload))
    }
}

struct KnownDevice {
    name: String,
}

pub struct BluetoothProducer {
    frames: mpsc::Receiver<AdvertisementFrame>,
    parsers: ParserRegistry,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl BluetoothProducer {
    pub fn new(frames: mpsc::Receiver<AdvertisementFrame>, parsers: ParserRegistry) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self { frames, parsers, ready_tx, ready_rx }
    }

    async fn run(mut self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let _ = self.ready_tx.send(true);
        let _ = events.send(ProducerEvent::ScanStart);

        let mut known: HashMap<String, KnownDevice> = HashMap::new();
        let mut last_frame_at = tokio::time::Instant::now();
        let mut scan_stop_pending = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = events.send(ProducerEvent::ScanStop);
                        return;
                    }
                }
                frame = self.frames.recv() => {
                    let Some(frame) = frame else {
                        scan_stop_pending = true;
                        continue;
                    };
                    last_frame_at = tokio::time::Instant::now();
                    scan_stop_pending = false;

                    match known.get_mut(&frame.device_id) {
                        None => {
                            known.insert(frame.device_id.clone(), KnownDevice { name: frame.name.clone() });
                            let _ = events.send(ProducerEvent::DeviceDiscovered {
                                device_id: frame.device_id.clone(),
                                name: frame.name.clone(),
                                manufacturer_id: frame.manufacturer_id,
                            });
                        }
                        Some(device) if device.name != frame.name => {
                            device.name = frame.name.clone();
                            let _ = events.send(ProducerEvent::DeviceUpdated {
                                device_id: frame.device_id.clone(),
                                fields: serde_json::json!({"name": frame.name}),
                            });
                        }
                        _ => {}
                    }

                    if let Some(measurement) = self.parsers.parse(frame.manufacturer_id, &frame.payload) {
                        debug!("parsed bluetooth payload from {}: {measurement:?}", frame.device_id);
                        let _ = events.send(ProducerEvent::DeviceData { device_id: frame.device_id, measurement });
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)), if scan_stop_pending => {
                    if last_frame_at.elapsed() >= Duration::from_millis(500) {
                        let _ = events.send(ProducerEvent::ScanStop);
                        return;
                    }
                }
            }
        }
    }
}

impl Producer for BluetoothProducer {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    fn spawn(self: Box<Self>, events: EventSender, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn((*self).run(events, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_registry_dispatches_by_manufacturer_id() {
        let mut registry = ParserRegistry::default();
        registry.register(0x004C, Box::new(|payload| Some(serde_json::json!({"len": payload.len()}))));
        assert_eq!(registry.parse(0x004C, &[1, 2, 3]), Some(serde_json::json!({"len": 3})));
        assert_eq!(registry.parse(0x1234, &[1, 2, 3]), None);
    }
}
