//! Recognition session state machine.
//!
//! ```text
//!            start()                 stop() / deadline
//!   Idle ─────────────▶ Active ─────────────────────▶ Idle
//! ```
//!
//! Each Active period gets a fresh epoch, a gallery snapshot, an empty
//! [`DedupGuard`] and a one-shot deadline. Frames are tagged with the epoch
//! they were admitted under; the worker applies a result only while that
//! same epoch is still active, checked under the state lock, so nothing
//! admitted before a stop can reach the store after it.

use crate::dedup::DedupGuard;
use crate::recorder::{AttendanceRecorder, Outcome, Screening};
use crate::scheduler::{Admission, FrameScheduler, Job};
use chrono::{DateTime, Local};
use rollcall_core::{
    AttendanceStore, EmbeddingExtractor, Gallery, GalleryStore, StoreError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

/// Capacity of the event channel. Slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to load gallery: {0}")]
    GalleryLoad(#[from] StoreError),
    #[error("gallery load task failed: {0}")]
    LoadTask(#[from] tokio::task::JoinError),
    #[error("failed to spawn recognition worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cosine distance a match must stay strictly below.
    pub threshold: f32,
    /// How long a session stays active before it ends on its own.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Why an active session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` was called.
    Stopped,
    /// The deadline expired.
    TimedOut,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Stopped => "stopped",
            StopReason::TimedOut => "timed_out",
        }
    }
}

/// Everything observers see, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { epoch: u64, enrolled: usize },
    Outcome { epoch: u64, outcome: Outcome },
    /// The frame held no usable face.
    NoFace { epoch: u64 },
    /// Extraction or storage failed for one frame; the session carries on.
    Failed { epoch: u64, error: String },
    Ended { epoch: u64, reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started { epoch: u64, enrolled: usize },
    /// A session was already running; it is left untouched.
    AlreadyActive { epoch: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub epoch: Option<u64>,
    pub started_at: Option<DateTime<Local>>,
    pub enrolled: usize,
    pub credited: usize,
    pub timeout_secs: u64,
}

struct ActiveSession {
    epoch: u64,
    started_at: DateTime<Local>,
    gallery: Gallery,
    dedup: DedupGuard,
    deadline: AbortHandle,
}

enum SessionState {
    Idle,
    Active(ActiveSession),
}

struct Shared<S> {
    store: Arc<S>,
    recorder: AttendanceRecorder<S>,
    state: Mutex<SessionState>,
    last_epoch: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    timeout: Duration,
}

impl<S> Shared<S> {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_epoch(&self) -> Option<u64> {
        match &*self.lock_state() {
            SessionState::Active(active) => Some(active.epoch),
            SessionState::Idle => None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Leave the active state. With `only_epoch`, only that session may be
    /// ended, so a stale deadline cannot stop a later session.
    fn end(&self, only_epoch: Option<u64>, reason: StopReason) -> bool {
        let mut state = self.lock_state();
        let active = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Active(active) if only_epoch.map_or(true, |e| e == active.epoch) => {
                active
            }
            other => {
                *state = other;
                return false;
            }
        };

        if reason == StopReason::Stopped {
            active.deadline.abort();
        }
        tracing::info!(
            epoch = active.epoch,
            reason = reason.as_str(),
            credited = active.dedup.credited_count(),
            elapsed_secs = (Local::now() - active.started_at).num_seconds(),
            "recognition session ended"
        );
        self.emit(SessionEvent::Ended {
            epoch: active.epoch,
            reason,
        });
        true
    }
}

/// Handle to the recognition pipeline. Clones share one session.
pub struct RecognitionSession<S, F> {
    shared: Arc<Shared<S>>,
    scheduler: FrameScheduler<F>,
}

impl<S, F> Clone for RecognitionSession<S, F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S, F> RecognitionSession<S, F>
where
    S: GalleryStore + AttendanceStore + Send + Sync + 'static,
    F: Send + 'static,
{
    /// Spawn the recognition worker on a dedicated OS thread.
    ///
    /// The session starts Idle. The worker exits once every handle is dropped.
    pub fn spawn<E>(store: Arc<S>, extractor: E, config: SessionConfig) -> Result<Self, SessionError>
    where
        E: EmbeddingExtractor<Input = F>,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            recorder: AttendanceRecorder::new(Arc::clone(&store), config.threshold),
            store,
            state: Mutex::new(SessionState::Idle),
            last_epoch: AtomicU64::new(0),
            events,
            timeout: config.timeout,
        });
        let (scheduler, rx) = FrameScheduler::new();

        let worker_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("rollcall-worker".into())
            .spawn(move || run_worker(worker_shared, extractor, rx))?;

        Ok(Self { shared, scheduler })
    }

    /// Enter Active: load the gallery, reset the dedup guard and arm the deadline.
    ///
    /// Must be called within a Tokio runtime. Calling it while Active is a
    /// no-op that reports the running session.
    pub async fn start(&self) -> Result<StartStatus, SessionError> {
        if let Some(epoch) = self.shared.active_epoch() {
            return Ok(StartStatus::AlreadyActive { epoch });
        }

        let store = Arc::clone(&self.shared.store);
        let enrollments = tokio::task::spawn_blocking(move || store.load_all_enrollments()).await??;
        let gallery = Gallery::from_enrollments(enrollments);

        let mut state = self.shared.lock_state();
        if let SessionState::Active(active) = &*state {
            return Ok(StartStatus::AlreadyActive {
                epoch: active.epoch,
            });
        }

        let epoch = self.shared.last_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let enrolled = gallery.len();
        let deadline = arm_deadline(Arc::downgrade(&self.shared), epoch, self.shared.timeout);

        *state = SessionState::Active(ActiveSession {
            epoch,
            started_at: Local::now(),
            gallery,
            dedup: DedupGuard::new(),
            deadline,
        });
        tracing::info!(
            epoch,
            enrolled,
            timeout_secs = self.shared.timeout.as_secs(),
            "recognition session started"
        );
        self.shared.emit(SessionEvent::Started { epoch, enrolled });

        Ok(StartStatus::Started { epoch, enrolled })
    }

    /// Operator stop. Returns whether a session was active.
    pub fn stop(&self) -> bool {
        self.shared.end(None, StopReason::Stopped)
    }

    /// Offer a frame to the pipeline. See [`Admission`] for rejections.
    pub fn submit(&self, frame: F) -> Admission<F> {
        match self.shared.active_epoch() {
            Some(epoch) => self.scheduler.submit(epoch, frame),
            None => Admission::Idle(frame),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active_epoch().is_some()
    }

    /// Whether a frame is currently being processed.
    pub fn in_flight(&self) -> bool {
        self.scheduler.is_busy()
    }

    pub fn status(&self) -> SessionStatus {
        let timeout_secs = self.shared.timeout.as_secs();
        match &*self.shared.lock_state() {
            SessionState::Active(active) => SessionStatus {
                active: true,
                epoch: Some(active.epoch),
                started_at: Some(active.started_at),
                enrolled: active.gallery.len(),
                credited: active.dedup.credited_count(),
                timeout_secs,
            },
            SessionState::Idle => SessionStatus {
                active: false,
                epoch: None,
                started_at: None,
                enrolled: 0,
                credited: 0,
                timeout_secs,
            },
        }
    }
}

fn arm_deadline<S>(shared: Weak<Shared<S>>, epoch: u64, timeout: Duration) -> AbortHandle
where
    S: Send + Sync + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(shared) = shared.upgrade() {
            // The state lock may be held across a store write.
            let _ = tokio::task::spawn_blocking(move || {
                shared.end(Some(epoch), StopReason::TimedOut)
            })
            .await;
        }
    })
    .abort_handle()
}

fn run_worker<S, E>(shared: Arc<Shared<S>>, mut extractor: E, mut rx: mpsc::Receiver<Job<E::Input>>)
where
    S: AttendanceStore,
    E: EmbeddingExtractor,
{
    tracing::info!("recognition worker started");
    while let Some(job) = rx.blocking_recv() {
        process_job(&shared, &mut extractor, &job);
        // Dropping the job frees the slot for the next frame.
    }
    tracing::info!("recognition worker exiting");
}

fn process_job<S, E>(shared: &Shared<S>, extractor: &mut E, job: &Job<E::Input>)
where
    S: AttendanceStore,
    E: EmbeddingExtractor,
{
    let epoch = job.epoch;
    if shared.active_epoch() != Some(epoch) {
        tracing::debug!(epoch, "skipping frame from ended session");
        return;
    }

    let embedding = match extractor.extract(&job.frame) {
        Ok(Some(embedding)) => embedding,
        Ok(None) => {
            emit_if_current(shared, epoch, SessionEvent::NoFace { epoch });
            return;
        }
        Err(e) => {
            tracing::warn!(epoch, error = %e, "embedding extraction failed; session continues");
            let error = e.to_string();
            emit_if_current(shared, epoch, SessionEvent::Failed { epoch, error });
            return;
        }
    };

    let best = {
        let state = shared.lock_state();
        let Some(active) = current(&state, epoch) else {
            tracing::debug!(epoch, "discarding result: session ended mid-frame");
            return;
        };
        match shared
            .recorder
            .screen(&embedding, &active.gallery, &active.dedup)
        {
            Screening::Settled(outcome) => {
                shared.emit(SessionEvent::Outcome { epoch, outcome });
                return;
            }
            Screening::Candidate(best) => best,
        }
    };

    // Store read without the state lock; stop() and status() never wait on it.
    let now = Local::now().naive_local();
    let recorded = shared.recorder.recorded_on(&best.id, now.date());

    let mut state = shared.lock_state();
    let SessionState::Active(active) = &mut *state else {
        tracing::debug!(epoch, "discarding result: session ended during lookup");
        return;
    };
    if active.epoch != epoch {
        tracing::debug!(epoch, "discarding result: session ended during lookup");
        return;
    }
    // Only the insert itself runs under the lock, so no write lands after a stop.
    let result = recorded.and_then(|recorded| {
        if recorded {
            Ok(Outcome::AlreadyCredited { id: best.id })
        } else {
            shared.recorder.commit(best, &mut active.dedup, now)
        }
    });
    let event = match result {
        Ok(outcome) => SessionEvent::Outcome { epoch, outcome },
        Err(e) => {
            tracing::warn!(epoch, error = %e, "recording failed; session continues");
            SessionEvent::Failed {
                epoch,
                error: e.to_string(),
            }
        }
    };
    // Emitted under the lock so a concurrent stop is observed after this result.
    shared.emit(event);
}

fn current(state: &SessionState, epoch: u64) -> Option<&ActiveSession> {
    match state {
        SessionState::Active(active) if active.epoch == epoch => Some(active),
        _ => None,
    }
}

fn emit_if_current<S>(shared: &Shared<S>, epoch: u64, event: SessionEvent) {
    let state = shared.lock_state();
    if current(&state, epoch).is_some() {
        shared.emit(event);
    } else {
        tracing::debug!(epoch, "discarding result: session ended mid-frame");
    }
}
