//! Producer services: the typed event surface that feeds the state core.
//!
//! Each producer is either **Continuous** (a long-running loop emitting
//! events as external inputs arrive) or **Scheduled** (a fixed interval with
//! an optional immediate tick). Both shapes converge on the same small
//! interface — start, stop, ready — rather than a class hierarchy: a
//! producer owns its loop, and `spawn` hands that loop to the runtime.

pub mod bluetooth;
pub mod modbus;
pub mod playback;
pub mod position;
pub mod retry;
pub mod tidal;
pub mod weather;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::EventSender;

/// Common lifecycle surface for all producers. `spawn` consumes the producer
/// and returns the task driving it; `ready` reports whether the producer has
/// completed whatever bootstrap it needs (bound, first fetch, etc.).
pub trait Producer: Send + 'static {
    fn name(&self) -> &'static str;
    fn ready(&self) -> watch::Receiver<bool>;
    fn spawn(self: Box<Self>, events: EventSender, shutdown: watch::Receiver<bool>) -> JoinHandle<()>;
}
