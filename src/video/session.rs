//! Capture session state machine
//!
//! A [`CaptureSession`] owns one open capture device and the buffer pool of
//! its current stream:
//!
//! ```text
//! Closed -> Opened -> Configured -> Streaming -> Configured -> Closed
//! ```
//!
//! Format negotiation is only possible outside `Streaming`. Buffers handed
//! out by [`CaptureSession::acquire_frame`] stay application-owned until
//! [`CaptureSession::release_frame`]; holding every buffer stalls the next
//! acquire, which is the natural backpressure of the hardware queue.

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::buffer::{BufferPool, CaptureBuffer};
use super::device::{CaptureDevice, ControlId, DeviceBackend, PhysAddr, Plane, Rect};
use super::format::{PixelFormat, Resolution};
use crate::error::{CameraError, Result};

/// Default bound on the first-frame and dequeue waits
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Opened => "opened",
            SessionState::Configured => "configured",
            SessionState::Streaming => "streaming",
        };
        write!(f, "{}", name)
    }
}

/// Negotiated geometry and encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn new(resolution: Resolution, pixel_format: PixelFormat) -> Self {
        Self {
            resolution,
            pixel_format,
        }
    }

    /// Bytes per buffer; 0 for compressed formats
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.resolution).unwrap_or(0)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resolution, self.pixel_format)
    }
}

/// One open capture device and its stream
pub struct CaptureSession {
    node: String,
    device: Option<Box<dyn CaptureDevice>>,
    state: SessionState,
    format: Option<FrameFormat>,
    pool: BufferPool,
    timeout: Duration,
    sequence: u64,
}

impl CaptureSession {
    /// Open `node` on `backend` and select `input`.
    ///
    /// Fails with `DeviceUnavailable` when the node cannot be opened, lacks
    /// the capture capability, or has no such input.
    pub fn open(
        backend: &dyn DeviceBackend,
        node: &str,
        input: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let unavailable =
            |what: &str, e: CameraError| CameraError::DeviceUnavailable(format!("{}: {}: {}", node, what, e));

        let mut device = backend.open_capture(node).map_err(|e| match e {
            CameraError::DeviceUnavailable(msg) => CameraError::DeviceUnavailable(msg),
            other => unavailable("open", other),
        })?;

        let caps = device.query_caps().map_err(|e| unavailable("querycap", e))?;
        if !caps.video_capture {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} ({}) is not a video capture device",
                node, caps.card
            )));
        }

        let input_info = device
            .enum_input(input)
            .map_err(|e| unavailable("enum input", e))?;
        device
            .set_input(input)
            .map_err(|e| unavailable("select input", e))?;

        info!(
            "Opened {} ({}, driver {}), input {} '{}'",
            node, caps.card, caps.driver, input, input_info.name
        );

        Ok(Self {
            node: node.to_string(),
            device: Some(device),
            state: SessionState::Opened,
            format: None,
            pool: BufferPool::new(),
            timeout,
            sequence: 0,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// Currently applied format
    pub fn format(&self) -> Option<FrameFormat> {
        self.format
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Buffers in the current stream
    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Bounds-checked buffer access
    ///
    /// # Panics
    ///
    /// Panics on an index outside the current pool.
    pub fn buffer_at(&self, index: usize) -> &CaptureBuffer {
        self.pool.buffer_at(index)
    }

    /// Driver sequence number of the last acquired frame
    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    fn device(&mut self) -> Result<&mut Box<dyn CaptureDevice>> {
        let node = &self.node;
        self.device
            .as_mut()
            .ok_or_else(|| CameraError::InvalidOperation(format!("{}: session is closed", node)))
    }

    /// Set geometry and pixel encoding. Only valid outside `Streaming`;
    /// a rejected request leaves the applied format untouched.
    pub fn negotiate_format(&mut self, resolution: Resolution, pixel_format: PixelFormat) -> Result<()> {
        match self.state {
            SessionState::Opened | SessionState::Configured => {}
            state => {
                return Err(CameraError::InvalidOperation(format!(
                    "{}: cannot negotiate format while {}",
                    self.node, state
                )));
            }
        }
        if !resolution.is_valid() {
            return Err(CameraError::UnsupportedFormat(format!(
                "{}: invalid resolution {}",
                self.node, resolution
            )));
        }

        let image_size = pixel_format.image_size(resolution);
        let node = self.node.clone();
        self.device()?
            .set_format(resolution, pixel_format, image_size)
            .map_err(|e| match e {
                CameraError::UnsupportedFormat(msg) => CameraError::UnsupportedFormat(msg),
                other => CameraError::UnsupportedFormat(format!(
                    "{}: {} {} rejected: {}",
                    node, resolution, pixel_format, other
                )),
            })?;

        let format = FrameFormat::new(resolution, pixel_format);
        debug!("{}: format set to {}", self.node, format);
        self.format = Some(format);
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Allocate and queue `buffer_count` buffers, start the stream and wait
    /// for the first frame. A no-op when already streaming.
    ///
    /// On timeout or device error the stream is torn down again and the
    /// session is back in `Configured`.
    pub fn start_streaming(&mut self, buffer_count: u32) -> Result<()> {
        match self.state {
            SessionState::Streaming => return Ok(()),
            SessionState::Configured => {}
            state => {
                return Err(CameraError::InvalidOperation(format!(
                    "{}: cannot start streaming while {}",
                    self.node, state
                )));
            }
        }
        let format = self.format.ok_or_else(|| {
            CameraError::InvalidOperation(format!("{}: no format negotiated", self.node))
        })?;
        if buffer_count == 0 {
            return Err(CameraError::InvalidArgument(
                "Buffer count must be at least 1".to_string(),
            ));
        }

        if let Err(e) = self.setup_stream(buffer_count, format) {
            self.teardown_stream();
            return Err(e);
        }

        self.state = SessionState::Streaming;
        info!(
            "{}: streaming {} with {} buffers",
            self.node,
            format,
            self.pool.len()
        );
        Ok(())
    }

    fn setup_stream(&mut self, buffer_count: u32, format: FrameFormat) -> Result<()> {
        let node = self.node.clone();
        let timeout = self.timeout;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CameraError::InvalidOperation(format!("{}: session is closed", node)))?;

        let granted = device.request_buffers(buffer_count)?;
        if granted == 0 {
            return Err(CameraError::ResourceError(format!(
                "{}: driver granted no buffers",
                node
            )));
        }
        if granted < buffer_count {
            debug!("{}: requested {} buffers, driver granted {}", node, buffer_count, granted);
        }

        self.pool
            .allocate(granted as usize, format.frame_size(), |index| {
                device.map_buffer(index)
            })?;

        for index in 0..self.pool.len() {
            device.queue_buffer(index)?;
        }
        device.stream_on()?;

        if !device.wait_ready(timeout)? {
            return Err(CameraError::CaptureTimeout {
                context: format!("{}: first frame", node),
                timeout,
            });
        }
        Ok(())
    }

    fn teardown_stream(&mut self) {
        let node = self.node.clone();
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.stream_off() {
                warn!("{}: stream off failed: {}", node, e);
            }
            self.pool.release();
            if let Err(e) = device.request_buffers(0) {
                debug!("{}: freeing driver buffers failed: {}", node, e);
            }
        } else {
            self.pool.release();
        }
    }

    /// Wait for a filled buffer and take ownership of it
    pub fn acquire_frame(&mut self) -> Result<usize> {
        if self.state != SessionState::Streaming {
            return Err(CameraError::InvalidOperation(format!(
                "{}: acquire while {}",
                self.node, self.state
            )));
        }
        let node = self.node.clone();
        let timeout = self.timeout;
        let device = self.device()?;

        if !device.wait_ready(timeout)? {
            return Err(CameraError::CaptureTimeout {
                context: format!("{}: waiting for frame", node),
                timeout,
            });
        }
        let dequeued = device.dequeue_buffer()?;
        self.pool.mark_dequeued(dequeued.index, dequeued.bytes_used)?;
        self.sequence = dequeued.sequence;
        Ok(dequeued.index)
    }

    /// Hand buffer `index` back to the driver
    pub fn release_frame(&mut self, index: usize) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(CameraError::InvalidOperation(format!(
                "{}: release while {}",
                self.node, self.state
            )));
        }
        self.pool.check_requeue(index)?;
        self.device()?.queue_buffer(index)?;
        self.pool.mark_queued(index);
        Ok(())
    }

    /// Stop the stream and unmap its buffers. A no-op when not streaming.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Ok(());
        }
        self.teardown_stream();
        self.state = SessionState::Configured;
        debug!("{}: streaming stopped", self.node);
        Ok(())
    }

    /// Set one control; returns the value the driver reports back
    pub fn apply_control(&mut self, id: ControlId, value: i32) -> Result<i32> {
        let node = self.node.clone();
        self.device()?.set_control(id, value).map_err(|e| match e {
            CameraError::DeviceError(msg) => CameraError::DeviceError(msg),
            other => CameraError::DeviceError(format!("{}: set {:?}: {}", node, id, other)),
        })
    }

    pub fn read_control(&mut self, id: ControlId) -> Result<i32> {
        let node = self.node.clone();
        self.device()?.get_control(id).map_err(|e| match e {
            CameraError::DeviceError(msg) => CameraError::DeviceError(msg),
            other => CameraError::DeviceError(format!("{}: get {:?}: {}", node, id, other)),
        })
    }

    /// Hardware address of one plane of buffer `index`, or
    /// [`PhysAddr::INVALID`] when the driver cannot resolve it
    pub fn physical_address(&mut self, index: usize, plane: Plane) -> PhysAddr {
        let id = match plane {
            Plane::Y => ControlId::PhysAddrY,
            Plane::CbCr => ControlId::PhysAddrCbCr,
        };
        match self.apply_control(id, index as i32) {
            Ok(value) => PhysAddr(value as u32),
            Err(e) => {
                warn!("{}: no physical address for buffer {}: {}", self.node, index, e);
                PhysAddr::INVALID
            }
        }
    }

    pub fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        self.device()?.set_frame_rate(fps)
    }

    pub fn crop_bounds(&mut self) -> Result<Rect> {
        self.device()?.crop_bounds()
    }

    pub fn set_crop(&mut self, rect: Rect) -> Result<()> {
        self.device()?.set_crop(rect)
    }

    /// Stop streaming and release the device
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.stop_streaming() {
            warn!("{}: stop on close failed: {}", self.node, e);
        }
        self.device = None;
        self.format = None;
        self.state = SessionState::Closed;
        debug!("{}: closed", self.node);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::buffer::BufferOwner;
    use crate::video::sim::{SimBackend, SimConfig, SimEncoderConfig};

    const NODE: &str = "/dev/video0";

    fn open(backend: &SimBackend) -> CaptureSession {
        CaptureSession::open(backend, NODE, 0, Duration::from_millis(200)).unwrap()
    }

    fn backend_with(config: SimConfig) -> SimBackend {
        SimBackend::with_config(config, SimEncoderConfig::default())
    }

    #[test]
    fn test_open_requires_capture_capability() {
        let backend = backend_with(SimConfig {
            capture_capable: false,
            ..Default::default()
        });
        let result = CaptureSession::open(&backend, NODE, 0, DEFAULT_FRAME_TIMEOUT);
        assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_open_rejects_missing_input() {
        let backend = SimBackend::new();
        let result = CaptureSession::open(&backend, NODE, 7, DEFAULT_FRAME_TIMEOUT);
        assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_acquire_release_cycle() {
        let backend = SimBackend::new();
        let mut session = open(&backend);
        assert_eq!(session.state(), SessionState::Opened);

        session
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        session.start_streaming(4).unwrap();
        assert_eq!(session.buffer_count(), 4);

        let index = session.acquire_frame().unwrap();
        assert!(index < 4);
        assert_eq!(session.buffer_at(index).owner(), BufferOwner::Application);
        assert_eq!(
            session.buffer_at(index).payload().len(),
            640 * 480 * 3 / 2
        );
        session.release_frame(index).unwrap();
        assert_eq!(session.buffer_at(index).owner(), BufferOwner::Driver);

        // Second acquire reuses the pool
        let again = session.acquire_frame().unwrap();
        assert!(again < 4);
        assert_eq!(backend.mapped_buffers(), 4);
        session.release_frame(again).unwrap();
    }

    #[test]
    fn test_start_streaming_is_idempotent() {
        let backend = SimBackend::new();
        let mut session = open(&backend);
        session
            .negotiate_format(Resolution::QVGA, PixelFormat::Nv21)
            .unwrap();
        session.start_streaming(4).unwrap();
        session.start_streaming(4).unwrap();
        assert_eq!(backend.node_state(NODE).stream_ons, 1);
        assert_eq!(backend.mapped_buffers(), 4);
    }

    #[test]
    fn test_negotiate_while_streaming_keeps_format() {
        let backend = SimBackend::new();
        let mut session = open(&backend);
        session
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .unwrap();
        session.start_streaming(2).unwrap();

        let result = session.negotiate_format(Resolution::QVGA, PixelFormat::Yuyv);
        assert!(matches!(result, Err(CameraError::InvalidOperation(_))));
        assert_eq!(
            session.format(),
            Some(FrameFormat::new(Resolution::VGA, PixelFormat::Yuv420))
        );
    }

    #[test]
    fn test_rejected_format_is_unsupported() {
        let backend = backend_with(SimConfig {
            rejected_formats: vec![PixelFormat::Rgb565],
            ..Default::default()
        });
        let mut session = open(&backend);
        let result = session.negotiate_format(Resolution::VGA, PixelFormat::Rgb565);
        assert!(matches!(result, Err(CameraError::UnsupportedFormat(_))));
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[test]
    fn test_mapping_failure_rolls_back() {
        let backend = backend_with(SimConfig {
            fail_map_index: Some(2),
            ..Default::default()
        });
        let mut session = open(&backend);
        session
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .unwrap();
        let result = session.start_streaming(4);
        assert!(matches!(result, Err(CameraError::ResourceError(_))));
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(backend.mapped_buffers(), 0);
        assert_eq!(session.buffer_count(), 0);
    }

    #[test]
    fn test_first_frame_timeout_returns_to_configured() {
        let backend = backend_with(SimConfig {
            stall_frames: true,
            ..Default::default()
        });
        let mut session =
            CaptureSession::open(&backend, NODE, 0, Duration::from_millis(20)).unwrap();
        session
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .unwrap();
        let result = session.start_streaming(4);
        assert!(matches!(result, Err(CameraError::CaptureTimeout { .. })));
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(backend.mapped_buffers(), 0);
        assert_eq!(backend.node_state(NODE).stream_offs, 1);
    }

    #[test]
    fn test_stop_streaming_when_idle_is_noop() {
        let backend = SimBackend::new();
        let mut session = open(&backend);
        session.stop_streaming().unwrap();
        assert_eq!(session.state(), SessionState::Opened);
        assert_eq!(backend.node_state(NODE).stream_offs, 0);
    }

    #[test]
    fn test_release_of_driver_owned_buffer_rejected() {
        let backend = SimBackend::new();
        let mut session = open(&backend);
        session
            .negotiate_format(Resolution::QVGA, PixelFormat::Yuv420)
            .unwrap();
        session.start_streaming(2).unwrap();
        assert!(matches!(
            session.release_frame(0),
            Err(CameraError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_control_round_trip_and_failure() {
        let backend = backend_with(SimConfig {
            failing_controls: vec![ControlId::Iso],
            ..Default::default()
        });
        let mut session = open(&backend);
        session.apply_control(ControlId::Contrast, 2).unwrap();
        assert_eq!(session.read_control(ControlId::Contrast).unwrap(), 2);

        assert!(matches!(
            session.apply_control(ControlId::Iso, 3),
            Err(CameraError::DeviceError(_))
        ));
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[test]
    fn test_physical_address_sentinel() {
        let backend = backend_with(SimConfig {
            physical_addresses: false,
            ..Default::default()
        });
        let mut session = open(&backend);
        assert_eq!(session.physical_address(0, Plane::Y), PhysAddr::INVALID);

        let backend = SimBackend::new();
        let mut session = open(&backend);
        assert_eq!(
            session.physical_address(1, Plane::Y),
            SimBackend::phys_addr(1)
        );
    }

    #[test]
    fn test_close_releases_everything() {
        let backend = SimBackend::new();
        let mut session = open(&backend);
        session
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .unwrap();
        session.start_streaming(4).unwrap();
        let _ = session.acquire_frame().unwrap();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.mapped_buffers(), 0);
        assert!(matches!(
            session.read_control(ControlId::Contrast),
            Err(CameraError::InvalidOperation(_))
        ));
    }
}
