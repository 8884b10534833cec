//! Weather producer: a Scheduled producer that fetches a forecast over
//! HTTPS, parameterised by the current position, with exponential backoff
//! and a debounce on position changes.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::{EventSender, ProducerEvent};
use crate::producers::retry::EXTERNAL_FETCH_RETRY;
use crate::producers::Producer;

pub struct WeatherProducer {
    http: reqwest::Client,
    position: watch::Receiver<Option<(f64, f64)>>,
    fetch_interval: Duration,
    endpoint_base: String,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl WeatherProducer {
    pub fn new(position: watch::Receiver<Option<(f64, f64)>>, fetch_interval: Duration, endpoint_base: String) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self { http: reqwest::Client::new(), position, fetch_interval, endpoint_base, ready_tx, ready_rx }
    }

    async fn run(mut self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let _ = self.ready_tx.send(true);

        loop {
            // Do not run until a valid position is known.
            while self.position.borrow().is_none() {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return; },
                    _ = self.position.changed() => {}
                }
            }

            // Debounce: wait at least 1s after the most recent position change.
            tokio::time::sleep(Duration::from_secs(1)).await;
            let position = *self.position.borrow();

            if let Some((lat, lon)) = position {
                self.fetch_with_retry(lat, lon, &events).await;
            }

            tokio::select! {
                _ = shutdown.changed() => if *shutdown.borrow() { return; },
                _ = tokio::time::sleep(self.fetch_interval) => {}
                _ = self.position.changed() => {}
            }
        }
    }

    async fn fetch_with_retry(&self, lat: f64, lon: f64, events: &EventSender) {
        for attempt in 1..=EXTERNAL_FETCH_RETRY.max_attempts {
            match self.fetch_once(lat, lon).await {
                Ok(report) => {
                    let _ = events.send(ProducerEvent::WeatherUpdate { report });
                    return;
                }
                Err(e) => {
                    warn!("weather fetch attempt {attempt} failed: {e}");
                    if attempt < EXTERNAL_FETCH_RETRY.max_attempts {
                        tokio::time::sleep(EXTERNAL_FETCH_RETRY.delay_for_attempt(attempt)).await;
                    } else {
                        let _ = events.send(ProducerEvent::WeatherError { message: e });
                    }
                }
            }
        }
    }

    async fn fetch_once(&self, lat: f64, lon: f64) -> Result<serde_json::Value, String> {
        let url = format!("{}?lat={lat}&lon={lon}", self.endpoint_base);
        let resp = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        resp.json::<serde_json::Value>().await.map_err(|e| e.to_string())
    }
}

impl Producer for WeatherProducer {
    fn name(&self) -> &'static str {
        "weather"
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    fn spawn(self: Box<Self>, events: EventSender, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!("weather producer starting, interval={:?}", self.fetch_interval);
        tokio::spawn((*self).run(events, shutdown))
    }
}
