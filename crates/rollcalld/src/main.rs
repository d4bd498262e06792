use anyhow::{Context, Result};
use rollcall_core::{Config, FaceExtractor};
use rollcall_engine::{RecognitionSession, SessionConfig};
use rollcall_hw::Camera;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod capture;
mod dbus_interface;

use capture::CaptureOptions;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        timeout_secs = config.session_timeout_secs,
        "configuration loaded"
    );

    // Fail fast on any missing resource.
    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );

    let scrfd_path = config.scrfd_model_path();
    let facenet_path = config.facenet_model_path();
    let extractor = FaceExtractor::load(&scrfd_path, &facenet_path)
        .context("failed to load face models")?;
    tracing::info!(scrfd = %scrfd_path, facenet = %facenet_path, "face models loaded");

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    let session = RecognitionSession::spawn(
        Arc::clone(&store),
        extractor,
        SessionConfig {
            threshold: config.match_threshold,
            timeout: config.session_timeout(),
        },
    )?;

    capture::spawn_capture(
        camera,
        session.clone(),
        CaptureOptions {
            warmup_frames: config.warmup_frames,
            skip_dark_frames: config.skip_dark_frames,
        },
    )
    .context("failed to spawn capture thread")?;

    let events = session.subscribe();
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(session.clone(), store))?
        .build()
        .await
        .context("failed to register on the session bus")?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let forwarder_conn = connection.clone();
    tokio::spawn(async move {
        if let Err(e) = dbus_interface::forward_events(forwarder_conn, events).await {
            tracing::error!(error = %e, "signal forwarder stopped");
        }
    });

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    session.stop();
    drop(connection);

    Ok(())
}
