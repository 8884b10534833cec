//! SyncOrchestrator: an adaptive per-(subscriber, dataType) throttle.
//! Computes the effective send interval from the base interval for a data
//! type, the active vessel-mode profile, and the measured link quality, then
//! either sends immediately or coalesces into a pending buffer flushed on a
//! timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_types::{LinkStatus, PatchOp, Priority, ProfileName};
use tokio::sync::Mutex;

const FLOOR_MS: u64 = 100;
const POOR_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
pub struct ProfileSettings {
    pub multiplier: f64,
    pub priority_boost: [f64; 3], // indexed by Priority as usize
}

impl ProfileSettings {
    pub fn for_profile(profile: ProfileName) -> Self {
        match profile {
            ProfileName::Normal => Self { multiplier: 1.0, priority_boost: [1.0, 1.0, 1.0] },
            ProfileName::HighSpeed => Self { multiplier: 0.5, priority_boost: [1.0, 0.5, 0.25] },
            ProfileName::Anchored => Self { multiplier: 2.0, priority_boost: [1.0, 1.0, 1.0] },
            ProfileName::PowerSaving => Self { multiplier: 4.0, priority_boost: [1.0, 2.0, 4.0] },
        }
    }
}

fn priority_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

/// `interval = base[dataType] x profile.multiplier x profile.priorityBoost[priority] x (POOR ? poorMultiplier : 1)`,
/// clamped to a 100ms floor.
pub fn effective_interval(base: Duration, priority: Priority, profile: ProfileName, link_status: LinkStatus) -> Duration {
    let settings = ProfileSettings::for_profile(profile);
    let poor_factor = if link_status == LinkStatus::Poor { POOR_MULTIPLIER } else { 1.0 };
    let millis = base.as_millis() as f64 * settings.multiplier * settings.priority_boost[priority_index(priority)] * poor_factor;
    Duration::from_millis((millis as u64).max(FLOOR_MS))
}

#[derive(Default)]
struct PendingBuffer {
    ops: Vec<PatchOp>,
}

impl PendingBuffer {
    /// Merge a new op in by path: later op overrides earlier on the same
    /// path; a `remove` cancels a prior `add`/`replace` on that path.
    fn merge(&mut self, op: PatchOp) {
        self.ops.retain(|existing| existing.path() != op.path());
        self.ops.push(op);
    }
}

struct StreamState {
    last_sent: Instant,
    pending: PendingBuffer,
    pending_version: u64,
    pending_timestamp_ms: i64,
    /// Whether a flush task is already scheduled for the current coalescing
    /// window, so repeated coalesced ops don't stack redundant timers.
    flush_scheduled: bool,
}

pub struct SyncOrchestrator {
    profile: Mutex<ProfileName>,
    link_status: Mutex<LinkStatus>,
    base_intervals: HashMap<&'static str, Duration>,
    streams: Mutex<HashMap<(String, String), StreamState>>,
}

pub enum PublishDecision {
    SendNow(Vec<PatchOp>),
    /// Coalesced into the pending buffer. Carries the delay until the
    /// throttle window closes only the first time a window is entered, so
    /// the caller schedules exactly one flush task per window.
    Coalesced { flush_after: Option<Duration> },
}

impl SyncOrchestrator {
    pub fn new(base_intervals: HashMap<&'static str, Duration>) -> Arc<Self> {
        Arc::new(Self {
            profile: Mutex::new(ProfileName::Normal),
            link_status: Mutex::new(LinkStatus::Good),
            base_intervals,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set_profile(&self, profile: ProfileName) {
        *self.profile.lock().await = profile;
    }

    pub async fn set_link_status(&self, status: LinkStatus) {
        *self.link_status.lock().await = status;
    }

    /// HIGH-priority data types (alerts, anchor) bypass coalescing entirely.
    pub async fn publish(
        &self,
        subscriber_id: &str,
        data_type: &str,
        priority: Priority,
        op: PatchOp,
        version: u64,
        timestamp_ms: i64,
    ) -> PublishDecision {
        if priority == Priority::High {
            return PublishDecision::SendNow(vec![op]);
        }

        let base = self.base_intervals.get(data_type).copied().unwrap_or(Duration::from_millis(1000));
        let profile = *self.profile.lock().await;
        let link_status = *self.link_status.lock().await;
        let interval = effective_interval(base, priority, profile, link_status);

        let mut streams = self.streams.lock().await;
        let key = (subscriber_id.to_string(), data_type.to_string());
        let now = Instant::now();
        let state = streams.entry(key).or_insert_with(|| StreamState {
            last_sent: now - interval,
            pending: PendingBuffer::default(),
            pending_version: version,
            pending_timestamp_ms: timestamp_ms,
            flush_scheduled: false,
        });

        if now.duration_since(state.last_sent) >= interval {
            // Merge in first so a `send` flushes any ops coalesced while we
            // were waiting for this window to close, instead of discarding
            // them in favor of only the op that happened to land last.
            state.pending.merge(op);
            state.pending_version = version;
            state.pending_timestamp_ms = timestamp_ms;
            state.last_sent = now;
            state.flush_scheduled = false;
            PublishDecision::SendNow(std::mem::take(&mut state.pending.ops))
        } else {
            state.pending.merge(op);
            state.pending_version = version;
            state.pending_timestamp_ms = timestamp_ms;
            if state.flush_scheduled {
                PublishDecision::Coalesced { flush_after: None }
            } else {
                state.flush_scheduled = true;
                let remaining = interval.saturating_sub(now.duration_since(state.last_sent));
                PublishDecision::Coalesced { flush_after: Some(remaining) }
            }
        }
    }

    /// Called by a coalesce-flush timer once `lastSent + interval` elapses.
    /// Returns `None` if nothing is pending (e.g. an immediate send already
    /// drained the buffer before the timer fired).
    pub async fn take_pending(&self, subscriber_id: &str, data_type: &str) -> Option<(Vec<PatchOp>, u64, i64)> {
        let mut streams = self.streams.lock().await;
        let state = streams.get_mut(&(subscriber_id.to_string(), data_type.to_string()))?;
        state.last_sent = Instant::now();
        state.flush_scheduled = false;
        if state.pending.ops.is_empty() {
            return None;
        }
        Some((std::mem::take(&mut state.pending.ops), state.pending_version, state.pending_timestamp_ms))
    }

    pub fn drop_subscriber(&self, subscriber_id: &str) {
        if let Ok(mut streams) = self.streams.try_lock() {
            streams.retain(|(id, _), _| id != subscriber_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_profile_quadruples_base_interval_floored() {
        let interval = effective_interval(Duration::from_millis(2000), Priority::Normal, ProfileName::Anchored, LinkStatus::Good);
        assert_eq!(interval, Duration::from_millis(4000));
    }

    #[test]
    fn floor_clamps_tiny_intervals() {
        let interval = effective_interval(Duration::from_millis(10), Priority::Low, ProfileName::HighSpeed, LinkStatus::Good);
        assert_eq!(interval, Duration::from_millis(FLOOR_MS));
    }

    #[tokio::test]
    async fn high_priority_always_sends_immediately() {
        let orchestrator = SyncOrchestrator::new(HashMap::from([("alerts", Duration::from_millis(5000))]));
        for i in 0..3 {
            let decision = orchestrator
                .publish("sub-1", "alerts", Priority::High, PatchOp::Remove { path: "/alerts/active/0".into() }, i, 0)
                .await;
            assert!(matches!(decision, PublishDecision::SendNow(_)));
        }
    }

    #[tokio::test]
    async fn normal_priority_coalesces_within_interval() {
        let orchestrator = SyncOrchestrator::new(HashMap::from([("navigation", Duration::from_millis(2000))]));
        let first = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(1) },
                1,
                1_000,
            )
            .await;
        assert!(matches!(first, PublishDecision::SendNow(_)));

        let second = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(2) },
                2,
                1_100,
            )
            .await;
        assert!(matches!(second, PublishDecision::Coalesced { flush_after: Some(_) }));
    }

    #[tokio::test]
    async fn next_send_carries_forward_ops_coalesced_while_waiting() {
        let orchestrator = SyncOrchestrator::new(HashMap::from([("navigation", Duration::from_millis(100))]));
        let first = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(1) },
                1,
                1_000,
            )
            .await;
        assert!(matches!(first, PublishDecision::SendNow(_)));

        let coalesced = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(2) },
                2,
                1_050,
            )
            .await;
        assert!(matches!(coalesced, PublishDecision::Coalesced { flush_after: Some(_) }));

        tokio::time::sleep(Duration::from_millis(120)).await;

        // A different path arrives right as the window closes. The earlier
        // coalesced speed update must ride along rather than being silently
        // replaced by only this new op.
        let sent = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/heading".into(), value: serde_json::json!(90) },
                3,
                1_200,
            )
            .await;
        match sent {
            PublishDecision::SendNow(ops) => {
                assert_eq!(ops.len(), 2);
                assert!(ops.iter().any(|op| op.path() == "/navigation/speed"));
                assert!(ops.iter().any(|op| op.path() == "/navigation/heading"));
            }
            _ => panic!("expected SendNow once the throttle window has closed"),
        }
    }

    #[tokio::test]
    async fn take_pending_returns_none_once_drained() {
        let orchestrator = SyncOrchestrator::new(HashMap::from([("navigation", Duration::from_millis(5000))]));
        let _ = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(1) },
                1,
                1_000,
            )
            .await;
        let _ = orchestrator
            .publish(
                "sub-1",
                "navigation",
                Priority::Normal,
                PatchOp::Replace { path: "/navigation/speed".into(), value: serde_json::json!(2) },
                2,
                1_050,
            )
            .await;

        let (ops, version, timestamp_ms) = orchestrator.take_pending("sub-1", "navigation").await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(version, 2);
        assert_eq!(timestamp_ms, 1_050);
        assert!(orchestrator.take_pending("sub-1", "navigation").await.is_none());
    }
}
