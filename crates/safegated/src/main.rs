use std::sync::Arc;

use anyhow::{Context, Result};
use safegate_core::admin::CredentialAdmin;
use safegate_core::{AccessPipeline, FaceAnalyzer, OnnxFaceEncoder, SqliteStore};
use tracing_subscriber::EnvFilter;
use zbus::connection;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::GateService;

const BUS_NAME: &str = "org.safegate.Gate1";
const OBJECT_PATH: &str = "/org/safegate/Gate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("safegated starting");

    let config = Arc::new(Config::load()?);

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    tracing::info!(path = %config.db_path.display(), "credential store opened");

    let detector_path = config.detector_model_path();
    let recognizer_path = config.recognizer_model_path();
    let encoder = OnnxFaceEncoder::load(&detector_path, &recognizer_path)
        .context("loading face models")?;
    tracing::info!(detector = %detector_path, recognizer = %recognizer_path, "face models loaded");

    let engine = engine::spawn_engine(Box::new(encoder), config.encoder_timeout);
    tracing::info!(timeout_ms = engine.timeout().as_millis() as u64, "encoder engine running");
    let engine_stats = engine.stats();
    let analyzer: Arc<dyn FaceAnalyzer> = Arc::new(engine);

    let pipeline = Arc::new(AccessPipeline::new(
        store.clone(),
        store.clone(),
        analyzer.clone(),
        config.pipeline(),
    ));
    let admin = Arc::new(CredentialAdmin::new(store, analyzer));
    let service = GateService::new(pipeline, admin, config.clone(), engine_stats);

    let builder = match config.bus {
        BusKind::System => connection::Builder::system()?,
        BusKind::Session => connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(
        bus = ?config.bus,
        threshold = config.match_threshold,
        policy = ?config.multi_face_policy,
        "safegated ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("safegated shutting down");

    Ok(())
}
