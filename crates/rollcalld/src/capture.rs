//! Camera capture thread: streams frames into the session while it is Active.

use image::GrayImage;
use rollcall_engine::{Admission, RecognitionSession};
use rollcall_hw::{Camera, Frame};
use rollcall_store::SqliteStore;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub type Session = RecognitionSession<SqliteStore, GrayImage>;

/// Pause before re-opening the stream after a capture error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub warmup_frames: usize,
    pub skip_dark_frames: bool,
}

/// Spawn the capture loop on a dedicated OS thread.
///
/// The camera is idle between sessions; a stream is opened when a session
/// starts and closed as soon as it ends.
pub fn spawn_capture(
    camera: Camera,
    session: Session,
    options: CaptureOptions,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || run_capture(&camera, &session, options))
}

fn run_capture(camera: &Camera, session: &Session, options: CaptureOptions) {
    tracing::info!(device = %camera.device_path, "capture thread started");
    let mut events = session.subscribe();

    loop {
        if session.is_active() {
            match camera.stream(options.warmup_frames, |frame| {
                offer_frame(session, frame, options.skip_dark_frames)
            }) {
                Ok(delivered) => tracing::debug!(delivered, "capture paused"),
                Err(e) => {
                    tracing::error!(error = %e, "capture failed; retrying");
                    std::thread::sleep(RETRY_DELAY);
                }
            }
            continue;
        }

        // Sleep until the next session event; anything may mean a start.
        match events.blocking_recv() {
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    tracing::info!("capture thread exiting");
}

fn offer_frame(session: &Session, frame: Frame, skip_dark: bool) -> ControlFlow<()> {
    // Checked first so a stop ends the stream even when every frame is dark.
    if !session.is_active() {
        return ControlFlow::Break(());
    }
    if skip_dark && frame.is_dark() {
        tracing::trace!(seq = frame.sequence, "skipping dark frame");
        return ControlFlow::Continue(());
    }

    let seq = frame.sequence;
    let Some(image) = GrayImage::from_raw(frame.width, frame.height, frame.data) else {
        tracing::warn!(seq, "frame size does not match its dimensions");
        return ControlFlow::Continue(());
    };

    match session.submit(image) {
        Admission::Accepted => ControlFlow::Continue(()),
        Admission::Busy(_) => {
            tracing::trace!(seq, "frame dropped: recognizer busy");
            ControlFlow::Continue(())
        }
        Admission::Idle(_) => ControlFlow::Break(()),
        Admission::Closed(_) => {
            tracing::error!("recognition worker is gone; stopping capture");
            ControlFlow::Break(())
        }
    }
}
