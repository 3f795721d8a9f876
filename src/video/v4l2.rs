//! V4L2 capture backend
//!
//! Devices are opened and queried through `v4l`'s safe API. Buffer
//! management, controls, inputs and cropping go through the raw ioctl layer
//! that `v4l` re-exports, because the pipeline needs per-index control over
//! the driver queue and access to the vendor physical-address controls.

use std::os::fd::BorrowedFd;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::prelude::*;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::device::{
    CaptureDevice, ControlId, DequeuedBuffer, DeviceBackend, DeviceCaps, InputInfo,
    MappedRegion, Rect,
};
use super::encoder::{EncoderDevice, TurboJpegEncoder};
use super::format::{PixelFormat, Resolution};
use crate::error::{CameraError, Result};

const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
/// Vendor controls of the camera interface driver
const V4L2_CID_PRIVATE_BASE: u32 = 0x0800_0000;

const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
const V4L2_CID_EXPOSURE: u32 = V4L2_CID_BASE + 17;
const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;
const V4L2_CID_COLORFX: u32 = V4L2_CID_BASE + 31;

const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
const V4L2_CID_AUTO_N_PRESET_WHITE_BALANCE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 20;
const V4L2_CID_ISO_SENSITIVITY: u32 = V4L2_CID_CAMERA_CLASS_BASE + 23;
const V4L2_CID_EXPOSURE_METERING: u32 = V4L2_CID_CAMERA_CLASS_BASE + 25;
const V4L2_CID_SCENE_MODE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 26;
const V4L2_CID_AUTO_FOCUS_START: u32 = V4L2_CID_CAMERA_CLASS_BASE + 28;
const V4L2_CID_AUTO_FOCUS_STOP: u32 = V4L2_CID_CAMERA_CLASS_BASE + 29;
const V4L2_CID_AUTO_FOCUS_STATUS: u32 = V4L2_CID_CAMERA_CLASS_BASE + 30;

const V4L2_CID_PADDR_Y: u32 = V4L2_CID_PRIVATE_BASE + 1;
const V4L2_CID_PADDR_CBCR: u32 = V4L2_CID_PRIVATE_BASE + 4;
const V4L2_CID_STREAM_PAUSE: u32 = V4L2_CID_PRIVATE_BASE + 53;
const V4L2_CID_OBJECT_POSITION_X: u32 = V4L2_CID_PRIVATE_BASE + 56;
const V4L2_CID_OBJECT_POSITION_Y: u32 = V4L2_CID_PRIVATE_BASE + 57;
const V4L2_CID_TOUCH_AF_START_STOP: u32 = V4L2_CID_PRIVATE_BASE + 58;
const V4L2_CID_CAM_JPEG_MAIN_SIZE: u32 = V4L2_CID_PRIVATE_BASE + 70;
const V4L2_CID_CAM_JPEG_MAIN_OFFSET: u32 = V4L2_CID_PRIVATE_BASE + 71;
const V4L2_CID_CAM_JPEG_POSTVIEW_OFFSET: u32 = V4L2_CID_PRIVATE_BASE + 73;
const V4L2_CID_FACE_DETECTION: u32 = V4L2_CID_PRIVATE_BASE + 90;

const AUTO_FOCUS_STATUS_BUSY: i32 = 1 << 0;
const AUTO_FOCUS_STATUS_REACHED: i32 = 1 << 1;
const AUTO_FOCUS_STATUS_FAILED: i32 = 1 << 2;

/// Driver control id for a pipeline control
fn control_cid(id: ControlId) -> u32 {
    match id {
        ControlId::Exposure => V4L2_CID_EXPOSURE,
        ControlId::Contrast => V4L2_CID_CONTRAST,
        ControlId::Saturation => V4L2_CID_SATURATION,
        ControlId::Sharpness => V4L2_CID_SHARPNESS,
        ControlId::ColorEffect => V4L2_CID_COLORFX,
        ControlId::WhiteBalance => V4L2_CID_AUTO_N_PRESET_WHITE_BALANCE,
        ControlId::SceneMode => V4L2_CID_SCENE_MODE,
        ControlId::Metering => V4L2_CID_EXPOSURE_METERING,
        ControlId::Iso => V4L2_CID_ISO_SENSITIVITY,
        ControlId::FocusMode => V4L2_CID_FOCUS_AUTO,
        ControlId::AutoFocusStart => V4L2_CID_AUTO_FOCUS_START,
        ControlId::AutoFocusResult => V4L2_CID_AUTO_FOCUS_STATUS,
        ControlId::PhysAddrY => V4L2_CID_PADDR_Y,
        ControlId::PhysAddrCbCr => V4L2_CID_PADDR_CBCR,
        ControlId::JpegMainSize => V4L2_CID_CAM_JPEG_MAIN_SIZE,
        ControlId::JpegMainOffset => V4L2_CID_CAM_JPEG_MAIN_OFFSET,
        ControlId::PostviewOffset => V4L2_CID_CAM_JPEG_POSTVIEW_OFFSET,
        ControlId::StreamPause => V4L2_CID_STREAM_PAUSE,
        ControlId::FaceDetection => V4L2_CID_FACE_DETECTION,
        ControlId::ObjectPositionX => V4L2_CID_OBJECT_POSITION_X,
        ControlId::ObjectPositionY => V4L2_CID_OBJECT_POSITION_Y,
        ControlId::TouchAutoFocus => V4L2_CID_TOUCH_AF_START_STOP,
    }
}

/// Map the standard auto-focus status bits onto the pipeline's result codes
/// (0 running, 1 focused, 2 cancelled, 3 failed)
fn focus_result(status: i32) -> i32 {
    if status & AUTO_FOCUS_STATUS_BUSY != 0 {
        0
    } else if status & AUTO_FOCUS_STATUS_REACHED != 0 {
        1
    } else if status & AUTO_FOCUS_STATUS_FAILED != 0 {
        3
    } else {
        2
    }
}

fn io_error(node: &str, what: &str, err: std::io::Error) -> CameraError {
    CameraError::DeviceError(format!("{}: {} failed: {}", node, what, err))
}

/// Backend for real V4L2 nodes, paired with the turbojpeg encoder
#[derive(Debug, Default, Clone)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn open_capture(&self, node: &str) -> Result<Box<dyn CaptureDevice>> {
        let device = Device::with_path(node).map_err(|e| {
            CameraError::DeviceUnavailable(format!("Failed to open device {}: {}", node, e))
        })?;
        let fd = device.handle().fd();
        debug!("Opened V4L2 device {} (fd {})", node, fd);
        Ok(Box::new(V4l2Device {
            node: node.to_string(),
            device,
            fd,
        }))
    }

    fn open_encoder(&self) -> Result<Box<dyn EncoderDevice>> {
        Ok(Box::new(TurboJpegEncoder::new()?))
    }
}

/// One mmap'd driver buffer
struct V4l2Mapping {
    ptr: *mut c_void,
    len: usize,
}

// The mapping is plain shared memory owned by this value alone.
unsafe impl Send for V4l2Mapping {}

impl MappedRegion for V4l2Mapping {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping until drop
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for V4l2Mapping {
    fn drop(&mut self) {
        // SAFETY: the region was returned by mmap with this length
        if let Err(e) = unsafe { v4l2::munmap(self.ptr, self.len) } {
            warn!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

/// Open V4L2 capture node
pub struct V4l2Device {
    node: String,
    device: Device,
    fd: c_int,
}

/// Issue an ioctl with a mutable argument struct, mapping failures to
/// `DeviceError` tagged with the request name
macro_rules! xioctl {
    ($dev:expr, $request:ident, $arg:expr) => {
        // SAFETY: `$arg` is the argument struct the request expects and
        // outlives the call
        unsafe { v4l2::ioctl($dev.fd, vidioc::$request, $arg as *mut _ as *mut c_void) }
            .map_err(|e| io_error(&$dev.node, stringify!($request), e))
    };
}

impl V4l2Device {
    fn capture_buffer(&self, index: u32) -> v4l_sys::v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct, all-zero is valid
        let mut buf: v4l_sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf
    }
}

impl CaptureDevice for V4l2Device {
    fn node(&self) -> &str {
        &self.node
    }

    fn query_caps(&mut self) -> Result<DeviceCaps> {
        let caps = self
            .device
            .query_caps()
            .map_err(|e| io_error(&self.node, "VIDIOC_QUERYCAP", e))?;
        Ok(DeviceCaps {
            video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(Flags::STREAMING),
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
        })
    }

    fn enum_input(&mut self, index: u32) -> Result<InputInfo> {
        // SAFETY: plain C struct
        let mut input: v4l_sys::v4l2_input = unsafe { std::mem::zeroed() };
        input.index = index;
        xioctl!(self, VIDIOC_ENUMINPUT, &mut input)?;
        let name_len = input
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(input.name.len());
        let name = input.name[..name_len]
            .iter()
            .map(|&c| c as u8 as char)
            .collect();
        Ok(InputInfo { index, name })
    }

    fn set_input(&mut self, index: u32) -> Result<()> {
        let mut value = index as c_int;
        xioctl!(self, VIDIOC_S_INPUT, &mut value)
    }

    fn enum_formats(&mut self) -> Result<Vec<PixelFormat>> {
        let descs = self
            .device
            .enum_formats()
            .map_err(|e| io_error(&self.node, "VIDIOC_ENUM_FMT", e))?;
        Ok(descs
            .iter()
            .filter_map(|desc| PixelFormat::from_fourcc(desc.fourcc))
            .collect())
    }

    fn set_format(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
        image_size: u32,
    ) -> Result<()> {
        let mut fmt = Format::new(resolution.width, resolution.height, format.to_fourcc());
        fmt.size = image_size;
        let actual = self.device.set_format(&fmt).map_err(|e| {
            CameraError::UnsupportedFormat(format!(
                "{}: {} {} rejected: {}",
                self.node, resolution, format, e
            ))
        })?;
        if actual.fourcc != fmt.fourcc
            || actual.width != resolution.width
            || actual.height != resolution.height
        {
            return Err(CameraError::UnsupportedFormat(format!(
                "{}: requested {} {}, driver chose {}x{} {}",
                self.node, resolution, format, actual.width, actual.height, actual.fourcc
            )));
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        // SAFETY: plain C struct
        let mut req: v4l_sys::v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        xioctl!(self, VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: usize) -> Result<Box<dyn MappedRegion>> {
        let mut buf = self.capture_buffer(index as u32);
        xioctl!(self, VIDIOC_QUERYBUF, &mut buf)?;

        let len = buf.length as usize;
        // SAFETY: MMAP buffers report their offset in this union member
        let offset = unsafe { buf.m.offset };
        // SAFETY: offset and length come from QUERYBUF for this fd
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        }
        .map_err(|e| io_error(&self.node, "mmap", e))?;

        Ok(Box::new(V4l2Mapping { ptr, len }))
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        let mut buf = self.capture_buffer(index as u32);
        xioctl!(self, VIDIOC_QBUF, &mut buf)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        // SAFETY: the fd stays open for the lifetime of `self.device`
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(|e| {
            CameraError::DeviceError(format!("{}: poll failed: {}", self.node, e))
        })?;
        Ok(ready > 0)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let mut buf = self.capture_buffer(0);
        xioctl!(self, VIDIOC_DQBUF, &mut buf)?;
        Ok(DequeuedBuffer {
            index: buf.index as usize,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence as u64,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut buf_type = Type::VideoCapture as c_int;
        xioctl!(self, VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut buf_type = Type::VideoCapture as c_int;
        xioctl!(self, VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn get_control(&mut self, id: ControlId) -> Result<i32> {
        let mut ctrl = v4l_sys::v4l2_control {
            id: control_cid(id),
            value: 0,
        };
        xioctl!(self, VIDIOC_G_CTRL, &mut ctrl)?;
        if id == ControlId::AutoFocusResult {
            return Ok(focus_result(ctrl.value));
        }
        Ok(ctrl.value)
    }

    fn set_control(&mut self, id: ControlId, value: i32) -> Result<i32> {
        let (cid, value) = match (id, value) {
            (ControlId::AutoFocusStart, 0) => (V4L2_CID_AUTO_FOCUS_STOP, 1),
            _ => (control_cid(id), value),
        };
        let mut ctrl = v4l_sys::v4l2_control { id: cid, value };
        xioctl!(self, VIDIOC_S_CTRL, &mut ctrl)?;
        Ok(ctrl.value)
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        self.device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|e| io_error(&self.node, "VIDIOC_S_PARM", e))?;
        Ok(())
    }

    fn crop_bounds(&mut self) -> Result<Rect> {
        // SAFETY: plain C struct
        let mut cropcap: v4l_sys::v4l2_cropcap = unsafe { std::mem::zeroed() };
        cropcap.type_ = Type::VideoCapture as u32;
        xioctl!(self, VIDIOC_CROPCAP, &mut cropcap)?;
        let b = cropcap.bounds;
        Ok(Rect::new(b.left, b.top, b.width, b.height))
    }

    fn set_crop(&mut self, rect: Rect) -> Result<()> {
        // SAFETY: plain C struct
        let mut crop: v4l_sys::v4l2_crop = unsafe { std::mem::zeroed() };
        crop.type_ = Type::VideoCapture as u32;
        crop.c.left = rect.left;
        crop.c.top = rect.top;
        crop.c.width = rect.width;
        crop.c.height = rect.height;
        xioctl!(self, VIDIOC_S_CROP, &mut crop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_status_mapping() {
        assert_eq!(focus_result(AUTO_FOCUS_STATUS_BUSY), 0);
        assert_eq!(focus_result(AUTO_FOCUS_STATUS_REACHED), 1);
        assert_eq!(focus_result(0), 2);
        assert_eq!(focus_result(AUTO_FOCUS_STATUS_FAILED), 3);
    }

    #[test]
    fn test_private_controls_are_distinct() {
        let ids = [
            ControlId::PhysAddrY,
            ControlId::PhysAddrCbCr,
            ControlId::StreamPause,
            ControlId::JpegMainSize,
            ControlId::JpegMainOffset,
            ControlId::PostviewOffset,
            ControlId::FaceDetection,
            ControlId::ObjectPositionX,
            ControlId::ObjectPositionY,
            ControlId::TouchAutoFocus,
        ];
        let mut cids: Vec<u32> = ids.iter().map(|&id| control_cid(id)).collect();
        cids.sort_unstable();
        cids.dedup();
        assert_eq!(cids.len(), ids.len());
        assert!(cids.iter().all(|&cid| cid > V4L2_CID_PRIVATE_BASE));
    }

    #[test]
    fn test_open_missing_node_is_unavailable() {
        let backend = V4l2Backend::new();
        assert!(matches!(
            backend.open_capture("/dev/does-not-exist-video99"),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }
}
