use crate::capture::Session;
use chrono::Local;
use rollcall_engine::{Outcome, SessionEvent, StartStatus};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    session: Session,
    store: Arc<SqliteStore>,
}

impl AttendanceService {
    pub fn new(session: Session, store: Arc<SqliteStore>) -> Self {
        Self { session, store }
    }
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a recognition session. A running session is left as it is.
    async fn start(&self) -> fdo::Result<String> {
        tracing::info!("start requested");
        let status = self.session.start().await.map_err(failed)?;
        let reply = match status {
            StartStatus::Started { epoch, enrolled } => serde_json::json!({
                "started": true,
                "epoch": epoch,
                "enrolled": enrolled,
            }),
            StartStatus::AlreadyActive { epoch } => serde_json::json!({
                "started": false,
                "already_active": true,
                "epoch": epoch,
            }),
        };
        Ok(reply.to_string())
    }

    /// Stop the running session. Returns whether one was active.
    async fn stop(&self) -> fdo::Result<bool> {
        tracing::info!("stop requested");
        // The session lock can be held across a store write.
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.stop())
            .await
            .map_err(failed)
    }

    async fn status(&self) -> fdo::Result<String> {
        let session = self.session.clone();
        let status = tokio::task::spawn_blocking(move || session.status())
            .await
            .map_err(failed)?;
        let mut value = serde_json::to_value(&status).map_err(failed)?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }

    /// Today's attendance records as a JSON array, newest first.
    async fn today_attendance(&self) -> fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let today = Local::now().date_naive();
        let records = tokio::task::spawn_blocking(move || store.records_for_date(today))
            .await
            .map_err(failed)?
            .map_err(failed)?;
        serde_json::to_string(&records).map_err(failed)
    }

    #[zbus(signal)]
    async fn session_started(emitter: &SignalEmitter<'_>, enrolled: u32) -> zbus::Result<()>;

    /// `reason` is "stopped" or "timed_out".
    #[zbus(signal)]
    async fn session_ended(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn attendance_marked(
        emitter: &SignalEmitter<'_>,
        id: &str,
        confidence: f64,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn already_marked(emitter: &SignalEmitter<'_>, id: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn recognition_failed(emitter: &SignalEmitter<'_>, error: &str) -> zbus::Result<()>;
}

/// Re-emit session events as D-Bus signals until the session is dropped.
pub async fn forward_events(
    connection: zbus::Connection,
    mut events: broadcast::Receiver<SessionEvent>,
) -> zbus::Result<()> {
    let emitter = SignalEmitter::new(&connection, OBJECT_PATH)?;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "signal forwarder fell behind; events dropped");
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };

        let sent = match event {
            SessionEvent::Started { enrolled, .. } => {
                let enrolled = u32::try_from(enrolled).unwrap_or(u32::MAX);
                AttendanceService::session_started(&emitter, enrolled).await
            }
            SessionEvent::Ended { reason, .. } => {
                AttendanceService::session_ended(&emitter, reason.as_str()).await
            }
            SessionEvent::Outcome { outcome, .. } => match outcome {
                Outcome::Credited { id, confidence } => {
                    AttendanceService::attendance_marked(&emitter, &id, f64::from(confidence)).await
                }
                Outcome::AlreadyCredited { id } => {
                    AttendanceService::already_marked(&emitter, &id).await
                }
                Outcome::NoMatch | Outcome::EmptyGallery => {
                    tracing::debug!(?outcome, "no attendance change");
                    Ok(())
                }
            },
            SessionEvent::Failed { error, .. } => {
                AttendanceService::recognition_failed(&emitter, &error).await
            }
            SessionEvent::NoFace { .. } => Ok(()),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to emit D-Bus signal");
        }
    }
}
