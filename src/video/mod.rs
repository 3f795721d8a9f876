//! Video capture module
//!
//! Device control surface, buffer ownership, capture sessions, pixel
//! conversion and still encoding. The V4L2 backend drives real hardware;
//! the simulated backend backs the test suite and dry runs.

pub mod buffer;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod session;
pub mod sim;
pub mod v4l2;

pub use buffer::{BufferOwner, BufferPool, CaptureBuffer};
pub use device::{
    CaptureDevice, ControlId, DeviceBackend, DeviceCaps, MappedRegion, PhysAddr, Plane, Rect,
};
pub use encoder::{EncodeBridge, EncodeConfig, EncodeInput, ExifInfo, GpsInfo};
pub use format::{PixelFormat, Resolution};
pub use frame::CapturedFrame;
pub use session::{CaptureSession, FrameFormat, SessionState, DEFAULT_FRAME_TIMEOUT};
pub use sim::{SimBackend, SimConfig, SimEncoderConfig};
pub use v4l2::V4l2Backend;
