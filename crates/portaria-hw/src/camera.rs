//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{classify_open_error, FrameSource, StreamError, StreamHandle};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

/// Requested capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

struct Active {
    id: u64,
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// V4L2 camera. The device is only held open while a stream is active.
pub struct Camera {
    device_path: String,
    requested: Resolution,
    active: Option<Active>,
    next_id: u64,
}

impl Camera {
    pub fn new(device_path: &str, requested: Resolution) -> Self {
        Self {
            device_path: device_path.to_string(),
            requested,
            active: None,
            next_id: 1,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    fn open_device(&self) -> Result<Active, StreamError> {
        if !Path::new(&self.device_path).exists() {
            return Err(StreamError::DeviceNotFound(self.device_path.clone()));
        }

        let device = Device::with_path(&self.device_path)
            .map_err(|e| classify_open_error(&self.device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| StreamError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = %self.device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(StreamError::CaptureFailed(format!(
                "{} is not a video capture device",
                self.device_path
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| StreamError::CaptureFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.requested.width;
        fmt.height = self.requested.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| classify_open_error(&self.device_path, &e))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(StreamError::CaptureFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Active {
            id: 0,
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }
}

impl FrameSource for Camera {
    fn label(&self) -> &str {
        &self.device_path
    }

    fn start_stream(&mut self) -> Result<StreamHandle, StreamError> {
        if self.active.is_some() {
            return Err(StreamError::DeviceBusy(format!(
                "{} is already streaming",
                self.device_path
            )));
        }
        let mut active = self.open_device()?;
        active.id = self.next_id;
        self.next_id += 1;
        let handle = StreamHandle::new(active.id);
        self.active = Some(active);
        Ok(handle)
    }

    fn capture_frame(&mut self, handle: &StreamHandle) -> Result<Frame, StreamError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.id == handle.id())
            .ok_or(StreamError::NotStreaming)?;

        let mut stream = MmapStream::with_buffers(&active.device, BufType::VideoCapture, 4)
            .map_err(|e| StreamError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| StreamError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let rgb = match active.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, active.width, active.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, active.width, active.height),
        }
        .map_err(|e| StreamError::CaptureFailed(format!("conversion failed: {e}")))?;

        let frame = Frame::from_rgb(rgb, active.width, active.height, meta.sequence)
            .map_err(|e| StreamError::CaptureFailed(e.to_string()))?;
        if frame.is_dark {
            tracing::debug!(device = %self.device_path, seq = meta.sequence, "dark frame");
        }
        Ok(frame)
    }

    fn stop_stream(&mut self, handle: StreamHandle) {
        match self.active.take() {
            Some(active) if active.id == handle.id() => {
                tracing::info!(device = %self.device_path, "camera released");
            }
            other => {
                // Stale handle: keep whatever stream is current.
                self.active = other;
            }
        }
    }
}
