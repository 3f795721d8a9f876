//! Capture device control surface
//!
//! The pipeline core never talks to a driver directly. It drives a
//! [`CaptureDevice`], which is implemented by the V4L2 backend for real
//! hardware and by the simulated backend for tests and dry runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::encoder::EncoderDevice;
use super::format::{PixelFormat, Resolution};
use crate::error::Result;

/// Capabilities reported by a capture device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub video_capture: bool,
    pub streaming: bool,
}

/// One selectable input of a capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub index: u32,
    pub name: String,
}

/// Rectangle in sensor coordinates (crop bounds and crop windows)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Result of dequeuing a filled buffer from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: usize,
    pub bytes_used: usize,
    pub sequence: u64,
}

/// Hardware (bus) address of a buffer plane, for zero-copy handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    /// Sentinel returned when the driver cannot resolve an address
    pub const INVALID: PhysAddr = PhysAddr(0xffff_ffff);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID && self.0 != 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Plane selector for physical address queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Y,
    CbCr,
}

/// Scalar device controls used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControlId {
    /// Exposure compensation (user-facing "brightness")
    Exposure,
    Contrast,
    Saturation,
    Sharpness,
    ColorEffect,
    WhiteBalance,
    SceneMode,
    Metering,
    Iso,
    FocusMode,
    /// Write 1 to start an auto-focus run, 0 to cancel it
    AutoFocusStart,
    /// 0 = running, 1 = focused, 2 = cancelled, anything else = failed
    AutoFocusResult,
    /// Set with a buffer index; the returned value is the Y plane address
    PhysAddrY,
    /// Set with a buffer index; the returned value is the CbCr plane address
    PhysAddrCbCr,
    JpegMainSize,
    JpegMainOffset,
    PostviewOffset,
    StreamPause,
    FaceDetection,
    /// Focus point in preview pixels
    ObjectPositionX,
    ObjectPositionY,
    /// 1 focuses on the object position, 0 returns to the full frame
    TouchAutoFocus,
}

/// Open capture device handle.
///
/// Buffer indices are always in `[0, granted)` where `granted` is the value
/// returned by the last successful [`CaptureDevice::request_buffers`].
pub trait CaptureDevice: Send {
    /// Device node this handle was opened from
    fn node(&self) -> &str;

    fn query_caps(&mut self) -> Result<DeviceCaps>;

    fn enum_input(&mut self, index: u32) -> Result<InputInfo>;

    fn set_input(&mut self, index: u32) -> Result<()>;

    /// Pixel formats the capture queue can produce
    fn enum_formats(&mut self) -> Result<Vec<PixelFormat>>;

    fn set_format(&mut self, resolution: Resolution, format: PixelFormat, image_size: u32)
        -> Result<()>;

    /// Request `count` driver buffers; returns the number granted.
    /// A count of zero frees the driver-side buffers.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Map buffer `index` into the process
    fn map_buffer(&mut self, index: usize) -> Result<Box<dyn MappedRegion>>;

    /// Hand buffer `index` to the driver
    fn queue_buffer(&mut self, index: usize) -> Result<()>;

    /// Wait until a filled buffer can be dequeued; `false` on timeout
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool>;

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    fn get_control(&mut self, id: ControlId) -> Result<i32>;

    /// Set a control; returns the value the driver reports back
    fn set_control(&mut self, id: ControlId, value: i32) -> Result<i32>;

    /// Set frame interval to 1/fps
    fn set_frame_rate(&mut self, fps: u32) -> Result<()>;

    fn crop_bounds(&mut self) -> Result<Rect>;

    fn set_crop(&mut self, rect: Rect) -> Result<()>;
}

/// A buffer mapping owned by the buffer pool; unmapped on drop
pub trait MappedRegion: Send {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for device handles
pub trait DeviceBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    fn open_capture(&self, node: &str) -> Result<Box<dyn CaptureDevice>>;

    fn open_encoder(&self) -> Result<Box<dyn EncoderDevice>>;
}
