//! facegate-hw: frame acquisition.
//!
//! Provides V4L2-based camera capture (converted to RGB and mirrored) and a
//! still-image replay source behind the common [`FrameSource`] trait.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, PixelFormat};
pub use frame::Frame;
pub use source::{FrameSource, ReplaySource, SourceError};
