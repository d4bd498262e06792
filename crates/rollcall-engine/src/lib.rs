//! rollcall-engine — Continuous recognition pipeline.
//!
//! Frames flow through a single-slot [`FrameScheduler`] to a dedicated worker
//! thread that extracts an embedding and hands it to the
//! [`AttendanceRecorder`]. The [`RecognitionSession`] owns the gallery, the
//! per-session [`DedupGuard`] and the deadline for one scanning period.

pub mod dedup;
pub mod recorder;
pub mod scheduler;
pub mod session;

pub use dedup::DedupGuard;
pub use recorder::{AttendanceRecorder, Outcome, RecordError, Screening};
pub use scheduler::{Admission, FrameScheduler, Job};
pub use session::{
    RecognitionSession, SessionConfig, SessionError, SessionEvent, SessionStatus, StartStatus,
    StopReason,
};
