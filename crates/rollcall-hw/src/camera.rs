//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Grey => frame::grey_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
///
/// Opening the device only negotiates the format; frames flow only inside
/// [`Camera::stream`].
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 capture device (e.g. "/dev/video0") at 640x480.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let (width, height, pixel_format) = negotiate(&device)?;
        tracing::info!(width, height, format = ?pixel_format, "negotiated format");

        Ok(Self {
            device,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Stream grayscale frames into `on_frame` until it returns `Break`.
    ///
    /// The first `warmup` frames are discarded while auto-exposure settles.
    /// Returns the number of frames delivered.
    pub fn stream<F>(&self, warmup: usize, mut on_frame: F) -> Result<u64, CameraError>
    where
        F: FnMut(Frame) -> ControlFlow<()>,
    {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
        tracing::debug!(device = %self.device_path, warmup, "capture stream started");

        let mut skipped = 0usize;
        let mut delivered = 0u64;
        loop {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;

            if skipped < warmup {
                skipped += 1;
                continue;
            }

            let data = self.pixel_format.to_grayscale(buf, self.width, self.height)?;
            let frame = Frame {
                data,
                width: self.width,
                height: self.height,
                timestamp: std::time::Instant::now(),
                sequence: meta.sequence,
            };
            delivered += 1;
            if on_frame(frame).is_break() {
                break;
            }
        }

        tracing::debug!(device = %self.device_path, delivered, "capture stream stopped");
        Ok(delivered)
    }
}

/// Ask for YUYV at 640x480; drivers for grayscale sensors answer with GREY or Y16.
fn negotiate(device: &Device) -> Result<(u32, u32, PixelFormat), CameraError> {
    let negotiation = |what: &str, e: std::io::Error| {
        CameraError::FormatNegotiationFailed(format!("{what}: {e}"))
    };
    let mut requested = device.format().map_err(|e| negotiation("read format", e))?;
    requested.fourcc = FourCC::new(b"YUYV");
    requested.width = REQUESTED_WIDTH;
    requested.height = REQUESTED_HEIGHT;

    let granted = device
        .set_format(&requested)
        .map_err(|e| negotiation("apply format", e))?;
    let pixel_format = PixelFormat::from_fourcc(granted.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
            granted.fourcc
        ))
    })?;
    Ok((granted.width, granted.height, pixel_format))
}
