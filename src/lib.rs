//! capture-hal - camera capture hardware abstraction
//!
//! This crate drives a V4L2-style camera: preview streaming to a display
//! sink and client callbacks, recording with zero-copy frame descriptors,
//! still capture through a hardware or software JPEG encoder, and
//! auto-focus. A simulated backend runs the whole pipeline without
//! hardware.

pub mod camera;
pub mod config;
pub mod error;
pub mod utils;
pub mod video;

pub use camera::{CameraHandle, CameraRegistry, CaptureOrchestrator};
pub use error::{CameraError, Result};
