//! Playback (demo) producer: replays a recorded sequence of patches at a
//! configurable speed, looping at end-of-file. The recording is a JSON-lines
//! sequence of `{offsetMs, patch}` records; each patch's measurement
//! timestamps are rewritten to the wall-clock time of replay so the
//! downstream monotonic-timestamp invariant still holds across loops.

use std::time::Duration;

use relay_types::{Patch, PatchOp};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::{EventSender, ProducerEvent};
use crate::producers::Producer;

#[derive(Debug, Deserialize)]
struct RecordedStep {
    #[serde(rename = "offsetMs")]
    offset_ms: u64,
    patch: Patch,
}

pub struct PlaybackProducer {
    steps: Vec<RecordedStep>,
    speed: f64,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl PlaybackProducer {
    /// Parses a JSON-lines recording. `speed` is a multiplier on playback
    /// rate: 2.0 replays twice as fast as recorded.
    pub fn from_jsonl(recording: &str, speed: f64) -> Self {
        let mut steps = Vec::new();
        for (line_no, line) in recording.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RecordedStep>(line) {
                Ok(step) => steps.push(step),
                Err(e) => warn!("skipping malformed playback record at line {}: {e}", line_no + 1),
            }
        }
        steps.sort_by_key(|s| s.offset_ms);
        let (ready_tx, ready_rx) = watch::channel(false);
        Self { steps, speed: speed.max(0.01), ready_tx, ready_rx }
    }

    async fn run(self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let _ = self.ready_tx.send(true);
        if self.steps.is_empty() {
            warn!("playback producer has no recorded steps, idling");
            let _ = shutdown.changed().await;
            return;
        }

        loop {
            let mut cursor_ms: u64 = 0;
            for step in &self.steps {
                let wait = step.offset_ms.saturating_sub(cursor_ms);
                let scaled = Duration::from_millis((wait as f64 / self.speed) as u64);
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return; },
                    _ = tokio::time::sleep(scaled) => {}
                }
                cursor_ms = step.offset_ms;

                let ops = retimestamp(&step.patch, now_ms());
                let _ = events.send(ProducerEvent::PlaybackPatch { ops });
            }
            info!("playback reached end of recording, looping");
        }
    }
}

fn retimestamp(patch: &Patch, wall_clock_ms: i64) -> Vec<PatchOp> {
    patch
        .ops
        .iter()
        .map(|op| match op {
            PatchOp::Add { path, value } => PatchOp::Add { path: path.clone(), value: retimestamp_value(value, wall_clock_ms) },
            PatchOp::Replace { path, value } => {
                PatchOp::Replace { path: path.clone(), value: retimestamp_value(value, wall_clock_ms) }
            }
            PatchOp::Remove { path } => PatchOp::Remove { path: path.clone() },
        })
        .collect()
}

fn retimestamp_value(value: &serde_json::Value, wall_clock_ms: i64) -> serde_json::Value {
    if let serde_json::Value::Object(map) = value {
        if map.contains_key("timestamp") && map.contains_key("source") {
            let mut rewritten = map.clone();
            rewritten.insert("timestamp".to_string(), serde_json::json!(wall_clock_ms));
            return serde_json::Value::Object(rewritten);
        }
    }
    value.clone()
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Producer for PlaybackProducer {
    fn name(&self) -> &'static str {
        "playback"
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
    fn parses_jsonl_and_sorts_by_offset() {
        let recording = "{\"offsetMs\": 500, \"patch\": {\"ops\": []}}\n{\"offsetMs\": 100, \"patch\": {\"ops\": []}}\n";
        let producer = PlaybackProducer::from_jsonl(recording, 1.0);
        assert_eq!(producer.steps.len(), 2);
        assert_eq!(producer.steps[0].offset_ms, 100);
    }

    #[test]
    fn retimestamp_rewrites_measurement_timestamp() {
        let patch = Patch::new(vec![PatchOp::Add {
            path: "/navigation/speed".into(),
            value: serde_json::json!({"value": 5.0, "timestamp": 1, "source": "playback"}),
        }]);
        let ops = retimestamp(&patch, 9999);
        match &ops[0] {
            PatchOp::Add { value, .. } => assert_eq!(value["timestamp"], serde_json::json!(9999)),
            _ => panic!("expected add op"),
        }
    }
}
