//! rollcall-hw — Camera capture for the recognition pipeline.
//!
//! Opens a V4L2 device, negotiates a grayscale-convertible pixel format and
//! streams 8-bit grayscale [`Frame`]s to a callback until told to stop.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::{Frame, FrameError};
