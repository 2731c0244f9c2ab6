use anyhow::{Context, Result};
use portaria_core::{AccessOrchestrator, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod engine;
mod store;

const BUS_NAME: &str = "org.portaria.Gatehouse1";
const OBJECT_PATH: &str = "/org/portaria/Gatehouse1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("portariad starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        face_camera = %config.face_camera,
        plate_camera = %config.plate_camera,
        cooldown_secs = config.cooldown_secs,
        liveness_required = config.liveness_required,
        "configuration loaded"
    );

    let store = store::SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let mut orchestrator = AccessOrchestrator::new(store, Arc::new(SystemClock), config.orchestrator());
    let residents = orchestrator
        .reload_registry()
        .context("failed to load residents")?;
    tracing::info!(residents, "registry loaded");

    let engine = engine::spawn_engine(orchestrator)?;

    // No in-process inference backend: detections arrive over D-Bus until one
    // is provided.
    let cameras = Arc::new(capture::Cameras::new(
        engine.clone(),
        capture::CaptureSettings {
            face_device: config.face_camera.clone(),
            plate_device: config.plate_camera.clone(),
            face_period: Duration::from_millis(config.face_poll_ms),
            plate_period: Duration::from_millis(config.plate_poll_ms),
        },
        None,
    ));

    let service = dbus_interface::GatehouseService::new(engine, cameras.clone(), config.records_page_size);
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "portariad ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("portariad shutting down");
    cameras.shutdown().await;

    Ok(())
}
