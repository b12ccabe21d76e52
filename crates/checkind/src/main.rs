use anyhow::Result;
use checkin_core::CheckinPipeline;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{RecognizerService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = config::DaemonConfig::from_env()?;
    tracing::info!(
        data_dir = %cfg.pipeline.data_dir.display(),
        model_dir = %cfg.pipeline.model_dir().display(),
        system_bus = cfg.system_bus,
        "checkind starting"
    );

    // Model loading happens here so a missing file fails startup.
    let pipeline = CheckinPipeline::from_config(cfg.pipeline)?;
    let engine = engine::spawn_engine(pipeline, cfg.queue_depth)?;

    let builder = if cfg.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RecognizerService::new(engine))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "checkind ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("checkind shutting down");

    Ok(())
}
