//! Modbus producer: polls a fixed register map on a scheduled interval. The
//! Modbus transport itself (serial/TCP line to the engine/tank/battery
//! gateway) is an external collaborator; this producer owns only the poll
//! schedule and per-register failure isolation.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::{EventSender, ProducerEvent};
use crate::producers::Producer;

#[derive(Debug, Clone)]
pub struct RegisterMapping {
    pub register: String,
    pub path: String,
}

/// Reads one register. Implemented against whatever transport the
/// deployment wires up; a failure on one register must not abort the poll
/// of the others.
pub trait RegisterReader: Send + 'static {
    fn read(&mut self, register: &str) -> Result<Value, String>;
}

pub struct ModbusProducer<R: RegisterReader> {
    reader: R,
    registers: Vec<RegisterMapping>,
    poll_interval: Duration,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<R: RegisterReader> ModbusProducer<R> {
    pub fn new(reader: R, registers: Vec<RegisterMapping>, poll_interval: Duration) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self { reader, registers, poll_interval, ready_tx, ready_rx }
    }

    async fn run(mut self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let _ = self.ready_tx.send(true);
        let mut last_good: HashMap<String, Value> = HashMap::new();
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => if *shutdown.borrow() { return; },
                _ = interval.tick() => {
                    for mapping in &self.registers {
                        match self.reader.read(&mapping.register) {
                            Ok(value) => {
                                last_good.insert(mapping.register.clone(), value.clone());
                                let _ = events.send(ProducerEvent::ModbusData {
                                    register: mapping.path.clone(),
                                    value,
                                });
                            }
                            Err(e) => {
                                warn!("modbus register {} read failed: {e}, retaining prior value", mapping.register);
                                let _ = events.send(ProducerEvent::ModbusError {
                                    register: mapping.path.clone(),
                                    message: e,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<R: RegisterReader> Producer for ModbusProducer<R> {
    fn name(&self) -> &'static str {
        "modbus"
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

    struct FlakyReader {
        fail_registers: Vec<&'static str>,
    }

    impl RegisterReader for FlakyReader {
        fn read(&mut self, register: &str) -> Result<Value, String> {
            if self.fail_registers.contains(&register) {
                Err("timeout".to_string())
            } else {
                Ok(serde_json::json!(42))
            }
        }
    }

    #[tokio::test]
    async fn one_failing_register_does_not_block_others() {
        let registers = vec![
            RegisterMapping { register: "r1".into(), path: "/vessel/systems/engine/rpm".into() },
            RegisterMapping { register: "r2".into(), path: "/vessel/systems/tank/level".into() },
        ];
        let producer = ModbusProducer::new(FlakyReader { fail_registers: vec!["r1"] }, registers, Duration::from_millis(10));
        let (events, mut rx) = tokio::sync::broadcast::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Box::new(producer).spawn(events, shutdown_rx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, ProducerEvent::ModbusError { .. }));
        assert!(matches!(second, ProducerEvent::ModbusData { .. }));
        handle.abort();
    }
}
