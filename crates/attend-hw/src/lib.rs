//! attend-hw: Webcam capture for the attendance engine.
//!
//! Wraps a V4L2 device as an [`attend_core::FrameSource`] producing
//! grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::FrameError;
