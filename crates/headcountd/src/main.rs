use anyhow::{Context, Result};
use headcount_core::{AttendanceStore, FeatureExtractor, Pipeline};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod store;

use config::BusKind;

const BUS_NAME: &str = "org.freedesktop.Headcount1";
const OBJECT_PATH: &str = "/org/freedesktop/Headcount1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        poll_ms = config.poll_interval.as_millis() as u64,
        unknown_policy = ?config.unknown_policy,
        shutdown_mode = ?config.shutdown_mode,
        bus = ?config.bus,
        "headcountd starting"
    );

    let store = Arc::new(
        store::SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let dyn_store: Arc<dyn AttendanceStore> = store.clone();
    let pipeline = Arc::new(
        Pipeline::start(dyn_store, FeatureExtractor::default(), config.pipeline_settings())
            .context("starting recognition pipeline")?,
    );

    let service = dbus_interface::HeadcountService::new(Arc::clone(&pipeline), store);
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "headcountd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("headcountd shutting down");

    let stats = tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("joining shutdown task")??;
    tracing::info!(
        processed = stats.processed,
        known = stats.known_recorded,
        unknown = stats.unknown_recorded,
        discarded = stats.discarded_on_shutdown,
        "headcountd stopped"
    );

    Ok(())
}
