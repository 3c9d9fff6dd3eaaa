//! rollcall-hw — Camera capture for live attendance.
//!
//! V4L2 capture with conversion of the negotiated pixel format to the RGB
//! order expected by the feature extractor.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureStream, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
