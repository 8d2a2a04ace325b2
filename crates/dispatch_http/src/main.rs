//! HTTP control plane for the ride-dispatch engine.
//!
//! Wires the engine together from environment configuration: sled storage,
//! the in-memory driver index (optionally seeded from a JSON file), the ETA
//! oracle (OSRM when built with the `osrm` feature and an endpoint is set,
//! straight-line speed model otherwise), the push-transport bridge, and the
//! offer worker pool. Serves until SIGINT, then drains the workers.

mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use dispatch_core::clock::{system_clock, SharedClock};
use dispatch_core::engine::{Engine, EngineConfig};
use dispatch_core::events::ChannelSink;
use dispatch_core::geoindex::GridDriverIndex;
use dispatch_core::model::{Availability, DriverId, DriverSnapshot, PushAddress, VehicleType};
use dispatch_core::pricing::{FixedSurge, PricingConfig};
use dispatch_core::queue::OfferQueue;
use dispatch_core::retry::RetryPolicy;
use dispatch_core::routing::{EtaOracle, SpeedModelEta};
use dispatch_core::scheduler::SchedulerConfig;
use dispatch_core::spatial::{GeoPoint, LatLonParser};
use dispatch_core::store::durable::Storage;

struct Settings {
    data_dir: PathBuf,
    bind: String,
    workers: usize,
    ack_seconds_default: u64,
    speed_kmh: f64,
    seed_file: Option<PathBuf>,
    #[cfg_attr(not(feature = "osrm"), allow(dead_code))]
    osrm_endpoint: Option<String>,
}

impl Settings {
    fn from_env() -> anyhow::Result<Self> {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        Ok(Self {
            data_dir: var("DISPATCH_DATA_DIR").unwrap_or_else(|| "dispatch-data".into()).into(),
            bind: var("DISPATCH_BIND").unwrap_or_else(|| "0.0.0.0:8080".into()),
            workers: var("DISPATCH_WORKERS")
                .map(|v| v.parse().context("DISPATCH_WORKERS must be a number"))
                .transpose()?
                .unwrap_or(4),
            ack_seconds_default: var("DISPATCH_ACK_SECONDS")
                .map(|v| v.parse().context("DISPATCH_ACK_SECONDS must be a number"))
                .transpose()?
                .unwrap_or(30),
            speed_kmh: var("DISPATCH_SPEED_KMH")
                .map(|v| v.parse().context("DISPATCH_SPEED_KMH must be a number"))
                .transpose()?
                .unwrap_or(40.0),
            seed_file: var("DISPATCH_SEED_FILE").map(Into::into),
            osrm_endpoint: var("OSRM_ENDPOINT"),
        })
    }
}

/// Driver record in the seed file: a JSON array of these.
#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedDriver {
    id: String,
    lat: f64,
    lon: f64,
    vehicle_type: String,
    push_address: Option<String>,
}

fn seed_drivers(index: &GridDriverIndex, path: &std::path::Path) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let drivers: Vec<SeedDriver> = serde_json::from_str(&raw).context("parsing seed file")?;
    let mut loaded = 0;
    for driver in drivers {
        let vehicle = VehicleType::normalize(&driver.vehicle_type)
            .with_context(|| format!("unknown vehicle type for seed driver {}", driver.id))?;
        index
            .upsert(DriverSnapshot {
                id: DriverId(driver.id),
                position: GeoPoint::new(driver.lat, driver.lon)
                    .map_err(|e| anyhow::anyhow!("{e}"))?,
                vehicle,
                availability: Availability::Active,
                push_address: driver.push_address.map(PushAddress),
            })
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        loaded += 1;
    }
    Ok(loaded)
}

fn build_eta(settings: &Settings, clock: SharedClock) -> Arc<dyn EtaOracle> {
    #[cfg(feature = "osrm")]
    if let Some(endpoint) = &settings.osrm_endpoint {
        tracing::info!(endpoint, "using OSRM table oracle");
        return Arc::new(dispatch_core::routing::osrm::OsrmTableClient::new(endpoint, clock));
    }
    tracing::info!(speed_kmh = settings.speed_kmh, "using speed-model eta oracle");
    Arc::new(SpeedModelEta::new(settings.speed_kmh, clock))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env()?;

    let storage = Storage::open(&settings.data_dir).map_err(|e| anyhow::anyhow!("{e}"))?;
    let dispatches = Arc::new(storage.dispatches().map_err(|e| anyhow::anyhow!("{e}"))?);
    let rides = Arc::new(storage.rides().map_err(|e| anyhow::anyhow!("{e}"))?);
    let queue = Arc::new(OfferQueue::open(storage.db()).map_err(|e| anyhow::anyhow!("{e}"))?);

    let index = Arc::new(GridDriverIndex::default());
    if let Some(path) = &settings.seed_file {
        let loaded = seed_drivers(&index, path)?;
        tracing::info!(count = loaded, "seeded driver index");
    }

    let (sink, mut outbound) = ChannelSink::new();
    // Push-transport bridge: the socket layer is a separate service; here
    // every event is surfaced on the log with its correlation id.
    tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            tracing::info!(
                event = event.name,
                correlation = %event.correlation,
                payload = %event.payload,
                "push event"
            );
        }
    });

    let clock = system_clock();
    let eta_oracle = build_eta(&settings, clock.clone());

    let engine = Engine::new(EngineConfig {
        dispatches,
        rides,
        queue,
        sink: Arc::new(sink),
        driver_index: index.clone(),
        registry: index.clone(),
        eta_oracle,
        geocoder: Arc::new(LatLonParser),
        surge: Arc::new(FixedSurge::default()),
        clock,
        retry: RetryPolicy::default(),
        pricing: PricingConfig::default(),
        ack_seconds_default: settings.ack_seconds_default,
    });

    let mut scheduler = engine.offer_scheduler(SchedulerConfig {
        workers: settings.workers,
        ..SchedulerConfig::default()
    });
    scheduler.start();

    let app = routes::router(routes::AppState {
        engine: engine.clone(),
        index,
    });
    let listener = tokio::net::TcpListener::bind(&settings.bind)
        .await
        .with_context(|| format!("binding {}", settings.bind))?;
    tracing::info!(addr = %settings.bind, workers = settings.workers, "dispatch api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining offer workers");
    scheduler.shutdown().await;
    Ok(())
}
