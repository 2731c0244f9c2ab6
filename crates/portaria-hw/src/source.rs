//! Frame source abstraction shared by the face and plate cameras.

use crate::frame::Frame;
use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("stream is not active")]
    NotStreaming,
}

impl StreamError {
    /// Whether retrying on the next tick can help. Permission and presence
    /// problems need an operator.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::CaptureFailed(_) | StreamError::DeviceBusy(_))
    }
}

/// Opaque token for an active stream. Only valid on the source that issued it.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamHandle {
    id: u64,
}

impl StreamHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A camera that can be started, sampled and released.
pub trait FrameSource: Send {
    /// Human-readable name, used in logs.
    fn label(&self) -> &str;

    fn start_stream(&mut self) -> Result<StreamHandle, StreamError>;

    /// Grab the most recent frame of an active stream.
    fn capture_frame(&mut self, handle: &StreamHandle) -> Result<Frame, StreamError>;

    /// Release the device. Consumes the handle.
    fn stop_stream(&mut self, handle: StreamHandle);
}

/// Map an OS error from opening a device onto the stream taxonomy.
pub fn classify_open_error(device: &str, err: &io::Error) -> StreamError {
    let detail = format!("{device}: {err}");
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => StreamError::PermissionDenied(detail),
        Some(libc::EBUSY) => StreamError::DeviceBusy(detail),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            StreamError::DeviceNotFound(detail)
        }
        _ => match err.kind() {
            io::ErrorKind::PermissionDenied => StreamError::PermissionDenied(detail),
            io::ErrorKind::NotFound => StreamError::DeviceNotFound(detail),
            _ => StreamError::CaptureFailed(detail),
        },
    }
}
