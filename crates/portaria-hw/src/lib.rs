//! portaria-hw — Camera capture for the gatehouse.
//!
//! Provides the [`FrameSource`] seam and a V4L2-backed [`Camera`] that
//! delivers RGB frames to the face and plate recognition loops.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, PixelFormat, Resolution};
pub use frame::{Frame, FrameError};
pub use source::{FrameSource, StreamError, StreamHandle};
