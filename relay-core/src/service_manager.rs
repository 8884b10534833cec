//! ServiceManager: starts the producers and transports in dependency order,
//! waits for each to report ready before starting the next, and tears them
//! down in reverse order on shutdown.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::events::EventSender;
use crate::producers::Producer;

struct RunningService {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Walks a manifest of producers in the order given, starting each and
/// waiting (bounded) for it to report readiness before moving to the next.
/// Later producers may assume earlier ones have already populated the
/// document groups they read from.
pub struct ServiceManager {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: Vec<RunningService>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self { shutdown_tx, shutdown_rx, running: Vec::new() }
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Starts `producer`, waits up to `ready_timeout` for it to become ready,
    /// and keeps its task handle for the eventual shutdown cascade.
    pub async fn start(&mut self, producer: Box<dyn Producer>, events: EventSender, ready_timeout: Duration) -> Result<(), RelayError> {
        let name = producer.name();
        let mut ready_rx = producer.ready();
        let handle = producer.spawn(events, self.shutdown_rx.clone());

        self.wait_for_ready(name, &mut ready_rx, ready_timeout).await?;
        info!("service '{name}' ready");
        self.running.push(RunningService { name, handle });
        Ok(())
    }

    async fn wait_for_ready(&self, name: &'static str, ready_rx: &mut watch::Receiver<bool>, timeout: Duration) -> Result<(), RelayError> {
        if *ready_rx.borrow() {
            return Ok(());
        }
        tokio::time::timeout(timeout, ready_rx.changed())
            .await
            .map_err(|_| RelayError::Timeout(format!("service '{name}' did not become ready within {timeout:?}")))?
            .map_err(|_| RelayError::Transport(format!("service '{name}' readiness channel closed before reporting ready")))?;
        Ok(())
    }

    /// Signals shutdown to every running service and waits (bounded per
    /// service) for its task to finish, in reverse start order.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        while let Some(service) = self.running.pop() {
            match tokio::time::timeout(Duration::from_secs(5), service.handle).await {
                Ok(Ok(())) => info!("service '{}' stopped", service.name),
                Ok(Err(e)) => warn!("service '{}' task panicked: {e}", service.name),
                Err(_) => warn!("service '{}' did not stop within the 5s grace period", service.name),
            }
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
