mod config;
mod coordinator;
mod document;
mod error;
mod events;
mod identity;
mod manager;
mod orchestrator;
mod producers;
mod rules;
mod service_manager;
mod store;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use config::Config;
use coordinator::ClientSyncCoordinator;
use error::{RelayError, EXIT_OK, EXIT_RUNTIME_ERROR, EXIT_STARTUP_FAILURE};
use events::new_bus;
use identity::IdentityCredential;
use manager::StateManager;
use orchestrator::SyncOrchestrator;
use producers::position::PositionProducer;
use producers::tidal::TidalProducer;
use producers::weather::WeatherProducer;
use service_manager::ServiceManager;
use store::StateStore;
use transport::hub::HubConnector;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "vessel_relay=info".into()),
        )
        .init();

    let exit_code = match run().await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("fatal error: {e}");
            if e.is_startup_fatal() {
                EXIT_STARTUP_FAILURE
            } else {
                EXIT_RUNTIME_ERROR
            }
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<(), RelayError> {
    let config = Config::from_env()?;
    info!("vessel-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let identity = Arc::new(IdentityCredential::load_or_create(&config.keys_dir, config.boat_id.as_deref()).await?);
    info!("boat identity: {}", identity.boat_id);

    let store = Arc::new(StateStore::new());
    let manager = Arc::new(StateManager::new(store.clone()));
    manager.bootstrap().await?;

    let base_intervals: HashMap<&'static str, Duration> = HashMap::from([
        ("alerts", Duration::from_millis(config.default_throttle_ms)),
        ("navigation", Duration::from_millis(config.default_throttle_ms)),
        ("environment", Duration::from_millis(config.signalk_refresh_ms)),
        ("bluetooth", Duration::from_millis(config.default_throttle_ms)),
        ("default", Duration::from_millis(config.default_throttle_ms)),
    ]);
    let orchestrator = SyncOrchestrator::new(base_intervals);
    let coordinator = ClientSyncCoordinator::new(manager.clone(), orchestrator.clone());

    let mut services = ServiceManager::new();
    let events = new_bus();

    let manager_for_bus = manager.clone();
    let producer_events = events.subscribe();
    tokio::spawn(async move { manager_for_bus.listen_to_service(producer_events).await });

    // Position fusion has no onboard GPS/AIS adapter wired in this build; it
    // starts with an empty source list so it reports ready immediately and
    // simply never emits. Plugging in a real feed means pushing readings into
    // a `PositionSource`'s channel from wherever that hardware is read.
    services.start(Box::new(PositionProducer::new(Vec::new())), events.clone(), READY_TIMEOUT).await?;

    let (position_tx, position_rx) = tokio::sync::watch::channel(None);
    tokio::spawn(forward_position_updates(events.subscribe(), position_tx));

    services
        .start(
            Box::new(WeatherProducer::new(position_rx.clone(), Duration::from_secs(1800), "https://api.open-meteo.com/v1/forecast".into())),
            events.clone(),
            READY_TIMEOUT,
        )
        .await?;
    services
        .start(
            Box::new(TidalProducer::new(position_rx, Duration::from_secs(7200), "https://api.tidesandcurrents.noaa.gov/api/prod/datagetter".into())),
            events.clone(),
            READY_TIMEOUT,
        )
        .await?;

    if !config.insecure_legacy_identity {
        let hub = HubConnector::new(
            config.hub_ws_url(),
            identity.clone(),
            coordinator.clone(),
            orchestrator.clone(),
            Duration::from_millis(config.reconnect_interval_ms),
            config.max_reconnect_attempts,
            Duration::from_millis(config.ping_interval_ms),
            Duration::from_millis(config.connection_timeout_ms),
        );
        services.start(Box::new(hub), events.clone(), READY_TIMEOUT).await?;
    } else {
        info!("hub connector disabled (INSECURE_LEGACY_IDENTITY set), running LAN-only");
    }

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = Router::new()
        .route("/health", get(health_check))
        .merge(transport::direct::router(coordinator.clone(), config.max_payload_bytes))
        .layer(cors);

    let addr = config.direct_bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Bind { addr: addr.clone(), source: e })?;
    info!("direct endpoint listening on {addr}");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("axum server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    services.stop().await;
    Ok(())
}

/// Bridges fused positions from the producer event bus onto a `watch`
/// channel, the shape the weather/tidal fetchers expect as input.
async fn forward_position_updates(mut events: events::EventReceiver, tx: tokio::sync::watch::Sender<Option<(f64, f64)>>) {
    loop {
        match events.recv().await {
            Ok(events::ProducerEvent::PositionUpdate { lat, lon, .. }) => {
                let _ = tx.send(Some((lat, lon)));
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}
