//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB on capture.
    Yuyv,
    /// Packed 24-bit RGB, passed through.
    Rgb24,
    /// Packed 24-bit BGR, channels swapped.
    Bgr24,
    /// 8-bit grayscale (IR cameras), replicated into RGB.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(PixelFormat::Rgb24)
        } else if fourcc == FourCC::new(b"BGR3") {
            Some(PixelFormat::Bgr24)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle producing RGB frames.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") at the
    /// default 640x480.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        Self::open_with_size(device_path, REQUESTED_WIDTH, REQUESTED_HEIGHT)
    }

    /// Open a device asking for `width`x`height` YUYV. The driver may pick
    /// a different size or format; the negotiated values are kept.
    pub fn open_with_size(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut wanted = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = width;
        wanted.height = height;
        let negotiated = device
            .set_format(&wanted)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let Some(pixel_format) = PixelFormat::from_fourcc(fourcc) else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "driver chose {fourcc:?}, expected YUYV, RGB3, BGR3 or GREY"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera ready"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start streaming. The returned [`CaptureStream`] keeps the device
    /// streaming until it is dropped; `discard` frames are read and thrown
    /// away first so auto-exposure can settle.
    pub fn stream(self, discard: usize) -> Result<CaptureStream, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let mut capture = CaptureStream {
            stream,
            camera: self,
        };
        for _ in 0..discard {
            capture.dequeue()?;
        }
        tracing::debug!(device = %capture.camera.device_path, discard, "streaming started");
        Ok(capture)
    }

    /// List V4L2 nodes `/dev/video0`..`/dev/video15` that can capture video.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// A camera that is streaming. Buffers stay queued between frames.
pub struct CaptureStream {
    // Dropped before `camera` so streaming stops before the device closes.
    stream: MmapStream<'static>,
    camera: Camera,
}

impl CaptureStream {
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Dequeue the next frame and convert it to RGB.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (data, sequence) = self.dequeue()?;
        Ok(Frame {
            data,
            width: self.camera.width,
            height: self.camera.height,
            sequence,
        })
    }

    fn dequeue(&mut self) -> Result<(Vec<u8>, u32), CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let cam = &self.camera;
        let rgb = to_rgb(cam.pixel_format, buf, cam.width, cam.height).map_err(|e| {
            CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", cam.pixel_format))
        })?;
        Ok((rgb, meta.sequence))
    }
}

/// Convert one raw buffer in `format` to packed RGB.
fn to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::gray_to_rgb(buf, width, height),
        PixelFormat::Bgr24 => frame::bgr_to_rgb(buf, width, height),
        PixelFormat::Rgb24 => {
            let expected = (width * height * 3) as usize;
            match buf.get(..expected) {
                Some(rgb) => Ok(rgb.to_vec()),
                None => Err(FrameError::InvalidLength {
                    expected,
                    actual: buf.len(),
                }),
            }
        }
    }
}

fn open_error(device_path: &str, e: std::io::Error) -> CameraError {
    if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}
