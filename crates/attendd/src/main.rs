use anyhow::{Context, Result};
use attend_core::{load_gallery, CsvDayStore, Ledger};
use attend_vision::OnnxExtractor;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::EngineParams;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(
        devices = ?config.camera_devices,
        tolerance = config.tolerance,
        history_len = config.history_len,
        confirm_threshold = config.confirm_threshold,
        tracker = ?config.tracker,
        "attendd starting"
    );

    engine::check_models(&config.model_dir).context("face models unavailable")?;

    // Gallery embeddings come from the same models the engines use.
    let gallery = {
        let mut extractor = OnnxExtractor::load(&config.model_dir)
            .context("failed to load face models")?
            .with_detection_thresholds(config.detect_threshold, config.nms_threshold);
        load_gallery(&config.gallery_dir, config.naming_convention(), &mut extractor)
            .with_context(|| format!("failed to load gallery from {}", config.gallery_dir.display()))?
    };
    let gallery = Arc::new(gallery);

    std::fs::create_dir_all(&config.ledger_dir).with_context(|| {
        format!("failed to create ledger directory {}", config.ledger_dir.display())
    })?;
    let ledger = Arc::new(Ledger::new(CsvDayStore::new(&config.ledger_dir)));
    tracing::info!(dir = %config.ledger_dir.display(), "ledger ready");

    let params = EngineParams {
        model_dir: config.model_dir.clone(),
        gallery: Arc::clone(&gallery),
        ledger: Arc::clone(&ledger),
        tracker: config.tracker,
        loop_config: config.loop_config(),
        warmup_frames: config.warmup_frames,
        detect_threshold: config.detect_threshold,
        nms_threshold: config.nms_threshold,
    };
    let engines =
        engine::spawn_all(&config.camera_devices, &params).context("failed to start engines")?;
    let (handles, threads): (Vec<_>, Vec<_>) = engines.into_iter().unzip();

    let service = AttendanceService {
        engines: handles.clone(),
        gallery,
        ledger,
    };
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "attendd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");

    for handle in &handles {
        handle.stop().await;
    }
    for (handle, thread) in handles.iter().zip(threads) {
        let device = handle.device().to_string();
        let joined = tokio::task::spawn_blocking(move || thread.join()).await?;
        match joined {
            Ok(reason) => tracing::info!(device = %device, ?reason, "engine joined"),
            Err(_) => tracing::error!(device = %device, "engine thread panicked"),
        }
    }

    Ok(())
}
