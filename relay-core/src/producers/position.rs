//! Position producer: fuses multiple position sources ranked by priority,
//! each with its own freshness TTL, and emits `position:update` only on a
//! meaningful change or a liveness tick.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{EventSender, ProducerEvent};
use crate::producers::Producer;

const EPSILON_DEG: f64 = 1e-6;
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Priority order, highest first: gps > ais > state-default.
const SOURCE_PRIORITY: &[&str] = &["gps", "ais", "state-default"];

#[derive(Debug, Clone, Copy)]
pub struct PositionReading {
    pub lat: f64,
    pub lon: f64,
}

/// A single upstream feed; real adapters push readings into `tx` from their
/// own I/O task (serial GPS reader, AIS decoder, etc). This producer only
/// owns the fusion logic.
pub struct PositionSource {
    pub name: &'static str,
    pub ttl: Duration,
    pub rx: mpsc::Receiver<PositionReading>,
}

pub struct PositionProducer {
    sources: Vec<PositionSource>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

struct SourceState {
    name: &'static str,
    ttl: Duration,
    last_reading: Option<(PositionReading, Instant)>,
}

impl PositionProducer {
    pub fn new(sources: Vec<PositionSource>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self { sources, ready_tx, ready_rx }
    }

    async fn run(mut self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let _ = self.ready_tx.send(true);

        let mut states: Vec<SourceState> = self
            .sources
            .iter()
            .map(|s| SourceState { name: s.name, ttl: s.ttl, last_reading: None })
            .collect();
        let mut last_emitted: Option<PositionReading> = None;
        let mut last_emitted_at = Instant::now() - LIVENESS_INTERVAL;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("position producer shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    for (source, state) in self.sources.iter_mut().zip(states.iter_mut()) {
                        while let Ok(reading) = source.rx.try_recv() {
                            state.last_reading = Some((reading, Instant::now()));
                        }
                    }

                    if let Some((winner_name, reading)) = fuse(&states) {
                        let changed = last_emitted
                            .map(|prev| (prev.lat - reading.lat).abs() > EPSILON_DEG || (prev.lon - reading.lon).abs() > EPSILON_DEG)
                            .unwrap_or(true);
                        let liveness_due = last_emitted_at.elapsed() >= LIVENESS_INTERVAL;

                        if changed || liveness_due {
                            debug!("position fused from {winner_name}: {:?}", reading);
                            let _ = events.send(ProducerEvent::PositionUpdate {
                                lat: reading.lat,
                                lon: reading.lon,
                                source: winner_name.to_string(),
                                timestamp_ms: now_ms(),
                            });
                            last_emitted = Some(reading);
                            last_emitted_at = Instant::now();
                        }
                    }
                }
            }
        }
    }
}

fn fuse(states: &[SourceState]) -> Option<(&'static str, PositionReading)> {
    for priority_name in SOURCE_PRIORITY {
        for state in states {
            if state.name != *priority_name {
                continue;
            }
            if let Some((reading, at)) = state.last_reading {
                if at.elapsed() <= state.ttl {
                    return Some((state.name, reading));
                }
            }
        }
    }
    None
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Producer for PositionProducer {
    fn name(&self) -> &'static str {
        "position"
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
    fn gps_wins_over_fresher_ais_when_within_ttl() {
        let states = vec![
            SourceState {
                name: "gps",
                ttl: Duration::from_secs(5),
                last_reading: Some((PositionReading { lat: 1.0, lon: 2.0 }, Instant::now())),
            },
            SourceState {
                name: "ais",
                ttl: Duration::from_secs(5),
                last_reading: Some((PositionReading { lat: 9.0, lon: 9.0 }, Instant::now())),
            },
        ];
        let (name, reading) = fuse(&states).unwrap();
        assert_eq!(name, "gps");
        assert_eq!(reading.lat, 1.0);
    }

    #[test]
    fn expired_gps_falls_through_to_ais() {
        let states = vec![
            SourceState {
                name: "gps",
                ttl: Duration::from_millis(1),
                last_reading: Some((PositionReading { lat: 1.0, lon: 2.0 }, Instant::now() - Duration::from_secs(1))),
            },
            SourceState {
                name: "ais",
                ttl: Duration::from_secs(5),
                last_reading: Some((PositionReading { lat: 9.0, lon: 9.0 }, Instant::now())),
            },
        ];
        let (name, _) = fuse(&states).unwrap();
        assert_eq!(name, "ais");
    }
}
