//! Single-slot frame admission with latest-frame-wins backpressure.
//!
//! At most one frame is in flight at any instant. A frame submitted while
//! the slot is taken is handed straight back to the caller; nothing is
//! queued and nothing is retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What happened to a submitted frame. Rejected frames are returned so the
/// caller can release whatever they hold.
#[derive(Debug)]
pub enum Admission<F> {
    Accepted,
    /// Another frame is still in the pipeline.
    Busy(F),
    /// No session is active.
    Idle(F),
    /// The worker has shut down.
    Closed(F),
}

impl<F> Admission<F> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Holds the in-flight slot; releases it on drop.
#[derive(Debug)]
struct SlotPermit(Arc<AtomicBool>);

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A frame admitted to the pipeline, tagged with the session it belongs to.
///
/// The slot stays occupied until the job is dropped.
#[derive(Debug)]
pub struct Job<F> {
    pub epoch: u64,
    pub frame: F,
    _permit: SlotPermit,
}

/// Sending half of the pipeline. Cheap to clone; all clones share one slot.
pub struct FrameScheduler<F> {
    in_flight: Arc<AtomicBool>,
    tx: mpsc::Sender<Job<F>>,
}

impl<F> Clone for FrameScheduler<F> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
            tx: self.tx.clone(),
        }
    }
}

impl<F> FrameScheduler<F> {
    /// Create a scheduler and the receiver the worker drains.
    pub fn new() -> (Self, mpsc::Receiver<Job<F>>) {
        let (tx, rx) = mpsc::channel(1);
        let scheduler = Self {
            in_flight: Arc::new(AtomicBool::new(false)),
            tx,
        };
        (scheduler, rx)
    }

    /// Admit `frame` if the slot is free, otherwise hand it back.
    pub fn submit(&self, epoch: u64, frame: F) -> Admission<F> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(epoch, "frame dropped: pipeline busy");
            return Admission::Busy(frame);
        }

        let job = Job {
            epoch,
            frame,
            _permit: SlotPermit(Arc::clone(&self.in_flight)),
        };
        match self.tx.try_send(job) {
            Ok(()) => Admission::Accepted,
            // The slot guarantees the channel is empty, so only a closed
            // worker can refuse. Dropping the job frees the slot.
            Err(e) => {
                let Job { frame, .. } = e.into_inner();
                Admission::Closed(frame)
            }
        }
    }

    /// Whether a frame currently occupies the pipeline.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}
