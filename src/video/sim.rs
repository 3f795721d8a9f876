//! Simulated capture and encoder devices
//!
//! An in-memory backend with deterministic frame content, used by the test
//! suite and by `--simulate` runs on hosts without camera hardware. Faults
//! can be injected through [`SimConfig`] and [`SimEncoderConfig`].

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::trace;

use super::device::{
    CaptureDevice, ControlId, DequeuedBuffer, DeviceBackend, DeviceCaps, InputInfo,
    MappedRegion, PhysAddr, Rect,
};
use super::encoder::{EncoderDevice, EncoderParam, ExifInfo, TurboJpegEncoder};
use super::format::{PixelFormat, Resolution};
use crate::error::{CameraError, Result};

/// Length of the JPEG payload a simulated sensor produces
pub const SIM_JPEG_LEN: usize = 512;

/// Base of the simulated physical address space
const SIM_PHYS_BASE: u32 = 0x4000_0000;
const SIM_PHYS_STRIDE: u32 = 0x0100_0000;

/// Fault injection and behaviour of simulated capture devices
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Report the video capture capability
    pub capture_capable: bool,
    /// Number of selectable inputs
    pub inputs: u32,
    /// Formats `set_format` rejects
    pub rejected_formats: Vec<PixelFormat>,
    /// Upper bound on granted buffers
    pub max_buffers: u32,
    /// Buffer index whose mapping fails
    pub fail_map_index: Option<usize>,
    /// Controls whose get/set requests fail
    pub failing_controls: Vec<ControlId>,
    /// Never deliver a frame
    pub stall_frames: bool,
    /// Delay between frames
    pub frame_interval: Duration,
    /// Resolve physical buffer addresses
    pub physical_addresses: bool,
    /// Value the auto-focus result control settles on
    pub autofocus_result: i32,
    /// Result reads that report "running" before settling
    pub autofocus_polls: u32,
    pub crop_bounds: Rect,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capture_capable: true,
            inputs: 2,
            rejected_formats: Vec::new(),
            max_buffers: 8,
            fail_map_index: None,
            failing_controls: Vec::new(),
            stall_frames: false,
            frame_interval: Duration::from_millis(2),
            physical_addresses: true,
            autofocus_result: 1,
            autofocus_polls: 2,
            crop_bounds: Rect::new(0, 0, 2560, 1920),
        }
    }
}

/// Fault injection of the simulated encoder
#[derive(Debug, Clone)]
pub struct SimEncoderConfig {
    pub physical_input: bool,
    /// Reject the quality parameter during configuration
    pub reject_quality: bool,
    pub fail_encode: bool,
    /// Use the turbojpeg device instead of the fake bitstream
    pub software_jpeg: bool,
}

impl Default for SimEncoderConfig {
    fn default() -> Self {
        Self {
            physical_input: true,
            reject_quality: false,
            fail_encode: false,
            software_jpeg: false,
        }
    }
}

/// Requests observed on one simulated node
#[derive(Debug, Clone, Default)]
pub struct SimNodeState {
    pub input: Option<u32>,
    pub format: Option<(Resolution, PixelFormat)>,
    pub controls: HashMap<ControlId, i32>,
    pub frame_rate: Option<u32>,
    pub crops: Vec<Rect>,
    pub stream_ons: u32,
    pub stream_offs: u32,
    /// Buffers dequeued over the node's lifetime
    pub dequeues: u64,
}

/// How the last simulated encode received its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEncodeInput {
    Copied(usize),
    Physical(PhysAddr),
}

#[derive(Default)]
struct SimShared {
    nodes: HashMap<String, SimNodeState>,
    encodes: Vec<SimEncodeInput>,
    encoder_params: Vec<EncoderParam>,
}

/// In-memory device backend
#[derive(Clone)]
pub struct SimBackend {
    config: SimConfig,
    encoder: SimEncoderConfig,
    shared: Arc<Mutex<SimShared>>,
    mapped: Arc<AtomicUsize>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default(), SimEncoderConfig::default())
    }

    pub fn with_config(config: SimConfig, encoder: SimEncoderConfig) -> Self {
        Self {
            config,
            encoder,
            shared: Arc::new(Mutex::new(SimShared::default())),
            mapped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Snapshot of the requests seen on `node`
    pub fn node_state(&self, node: &str) -> SimNodeState {
        self.shared
            .lock()
            .nodes
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of buffer mappings currently alive
    pub fn mapped_buffers(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }

    /// Inputs of every encode so far
    pub fn encodes(&self) -> Vec<SimEncodeInput> {
        self.shared.lock().encodes.clone()
    }

    /// Parameters of the last encoder configuration(s)
    pub fn encoder_params(&self) -> Vec<EncoderParam> {
        self.shared.lock().encoder_params.clone()
    }

    /// Byte every sample of raw buffer `index` is filled with
    pub fn pattern_byte(index: usize) -> u8 {
        ((index as u8).wrapping_add(1)).wrapping_mul(0x10)
    }

    /// Physical Y plane address of buffer `index`
    pub fn phys_addr(index: usize) -> PhysAddr {
        PhysAddr(SIM_PHYS_BASE + index as u32 * SIM_PHYS_STRIDE)
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn open_capture(&self, node: &str) -> Result<Box<dyn CaptureDevice>> {
        self.shared
            .lock()
            .nodes
            .entry(node.to_string())
            .or_default();
        Ok(Box::new(SimDevice {
            node: node.to_string(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            mapped: self.mapped.clone(),
            format: None,
            granted: 0,
            queue: VecDeque::new(),
            streaming: false,
            sequence: 0,
            phys_index: 0,
            af_polls: None,
        }))
    }

    fn open_encoder(&self) -> Result<Box<dyn EncoderDevice>> {
        if self.encoder.software_jpeg {
            return Ok(Box::new(TurboJpegEncoder::new()?));
        }
        Ok(Box::new(SimEncoder {
            config: self.encoder.clone(),
            shared: self.shared.clone(),
            input: Vec::new(),
            input_len: 0,
            physical: None,
            thumbnail: false,
            output: Vec::new(),
        }))
    }
}

struct SimRegion {
    data: Vec<u8>,
    mapped: Arc<AtomicUsize>,
}

impl MappedRegion for SimRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SimRegion {
    fn drop(&mut self) {
        self.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated capture device
pub struct SimDevice {
    node: String,
    config: SimConfig,
    shared: Arc<Mutex<SimShared>>,
    mapped: Arc<AtomicUsize>,
    format: Option<(Resolution, PixelFormat)>,
    granted: u32,
    queue: VecDeque<usize>,
    streaming: bool,
    sequence: u64,
    phys_index: usize,
    af_polls: Option<u32>,
}

impl SimDevice {
    fn with_node<R>(&self, f: impl FnOnce(&mut SimNodeState) -> R) -> R {
        let mut shared = self.shared.lock();
        f(shared.nodes.entry(self.node.clone()).or_default())
    }

    fn check_control(&self, id: ControlId) -> Result<()> {
        if self.config.failing_controls.contains(&id) {
            return Err(CameraError::DeviceError(format!(
                "{}: control {:?} rejected",
                self.node, id
            )));
        }
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        match self.format {
            Some((res, format)) => format
                .frame_size(res)
                .unwrap_or((res.pixels() as usize / 2).max(SIM_JPEG_LEN)),
            None => 0,
        }
    }

    fn phys_addr(&self, plane_cbcr: bool) -> PhysAddr {
        if !self.config.physical_addresses {
            return PhysAddr::INVALID;
        }
        let y = SimBackend::phys_addr(self.phys_index);
        if plane_cbcr {
            let luma = self.format.map(|(res, _)| res.pixels() as u32).unwrap_or(0);
            PhysAddr(y.0 + luma)
        } else {
            y
        }
    }
}

impl CaptureDevice for SimDevice {
    fn node(&self) -> &str {
        &self.node
    }

    fn query_caps(&mut self) -> Result<DeviceCaps> {
        Ok(DeviceCaps {
            driver: "sim".to_string(),
            card: format!("Simulated camera ({})", self.node),
            bus_info: "platform:sim".to_string(),
            video_capture: self.config.capture_capable,
            streaming: true,
        })
    }

    fn enum_input(&mut self, index: u32) -> Result<InputInfo> {
        if index >= self.config.inputs {
            return Err(CameraError::InvalidArgument(format!(
                "{}: no input {}",
                self.node, index
            )));
        }
        Ok(InputInfo {
            index,
            name: format!("sim-input-{}", index),
        })
    }

    fn set_input(&mut self, index: u32) -> Result<()> {
        self.enum_input(index)?;
        self.with_node(|state| state.input = Some(index));
        Ok(())
    }

    fn enum_formats(&mut self) -> Result<Vec<PixelFormat>> {
        let all = [
            PixelFormat::Nv12,
            PixelFormat::Nv12t,
            PixelFormat::Nv21,
            PixelFormat::Yuv420,
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Yuv422p,
            PixelFormat::Rgb565,
            PixelFormat::Jpeg,
        ];
        Ok(all
            .into_iter()
            .filter(|f| !self.config.rejected_formats.contains(f))
            .collect())
    }

    fn set_format(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
        _image_size: u32,
    ) -> Result<()> {
        if self.streaming {
            return Err(CameraError::DeviceError(format!(
                "{}: S_FMT while streaming",
                self.node
            )));
        }
        if self.config.rejected_formats.contains(&format) || !resolution.is_valid() {
            return Err(CameraError::UnsupportedFormat(format!(
                "{}: {} {} rejected",
                self.node, resolution, format
            )));
        }
        self.format = Some((resolution, format));
        self.with_node(|state| state.format = Some((resolution, format)));
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.queue.clear();
        self.granted = count.min(self.config.max_buffers);
        Ok(self.granted)
    }

    fn map_buffer(&mut self, index: usize) -> Result<Box<dyn MappedRegion>> {
        if index >= self.granted as usize {
            return Err(CameraError::DeviceError(format!(
                "{}: QUERYBUF {} out of range",
                self.node, index
            )));
        }
        if self.config.fail_map_index == Some(index) {
            return Err(CameraError::DeviceError(format!(
                "{}: mmap of buffer {} failed",
                self.node, index
            )));
        }

        let mut data = vec![SimBackend::pattern_byte(index); self.buffer_size()];
        if matches!(self.format, Some((_, PixelFormat::Jpeg))) {
            data.fill(0);
            data[0] = 0xFF;
            data[1] = 0xD8;
            data[SIM_JPEG_LEN - 2] = 0xFF;
            data[SIM_JPEG_LEN - 1] = 0xD9;
        }
        self.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimRegion {
            data,
            mapped: self.mapped.clone(),
        }))
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        if index >= self.granted as usize {
            return Err(CameraError::DeviceError(format!(
                "{}: QBUF {} out of range",
                self.node, index
            )));
        }
        if self.queue.contains(&index) {
            return Err(CameraError::DeviceError(format!(
                "{}: buffer {} already queued",
                self.node, index
            )));
        }
        self.queue.push_back(index);
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        if !self.streaming || self.queue.is_empty() || self.config.stall_frames {
            thread::sleep(timeout);
            return Ok(false);
        }
        thread::sleep(self.config.frame_interval.min(timeout));
        Ok(true)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        if !self.streaming {
            return Err(CameraError::DeviceError(format!(
                "{}: DQBUF while not streaming",
                self.node
            )));
        }
        let index = self.queue.pop_front().ok_or_else(|| {
            CameraError::DeviceError(format!("{}: DQBUF with empty queue", self.node))
        })?;
        self.sequence += 1;
        self.with_node(|s| s.dequeues += 1);
        let bytes_used = match self.format {
            Some((_, PixelFormat::Jpeg)) => SIM_JPEG_LEN,
            _ => self.buffer_size(),
        };
        trace!("{}: dequeued buffer {} seq {}", self.node, index, self.sequence);
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence: self.sequence,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.format.is_none() || self.granted == 0 {
            return Err(CameraError::DeviceError(format!(
                "{}: STREAMON before setup",
                self.node
            )));
        }
        self.streaming = true;
        self.with_node(|state| state.stream_ons += 1);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.queue.clear();
        self.with_node(|state| state.stream_offs += 1);
        Ok(())
    }

    fn get_control(&mut self, id: ControlId) -> Result<i32> {
        self.check_control(id)?;
        match id {
            ControlId::PhysAddrY => Ok(self.phys_addr(false).0 as i32),
            ControlId::PhysAddrCbCr => Ok(self.phys_addr(true).0 as i32),
            ControlId::JpegMainSize => Ok(SIM_JPEG_LEN as i32),
            ControlId::AutoFocusResult => match self.af_polls {
                Some(polls) if polls >= self.config.autofocus_polls => {
                    Ok(self.config.autofocus_result)
                }
                Some(polls) => {
                    self.af_polls = Some(polls + 1);
                    Ok(0)
                }
                None => Ok(self.config.autofocus_result),
            },
            _ => Ok(self.with_node(|state| state.controls.get(&id).copied().unwrap_or(0))),
        }
    }

    fn set_control(&mut self, id: ControlId, value: i32) -> Result<i32> {
        self.check_control(id)?;
        self.with_node(|state| {
            state.controls.insert(id, value);
        });
        match id {
            ControlId::PhysAddrY | ControlId::PhysAddrCbCr => {
                self.phys_index = value.max(0) as usize;
                Ok(self.phys_addr(id == ControlId::PhysAddrCbCr).0 as i32)
            }
            ControlId::AutoFocusStart => {
                self.af_polls = if value != 0 { Some(0) } else { None };
                Ok(value)
            }
            _ => Ok(value),
        }
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(CameraError::InvalidArgument("Frame rate 0".to_string()));
        }
        self.with_node(|state| state.frame_rate = Some(fps));
        Ok(())
    }

    fn crop_bounds(&mut self) -> Result<Rect> {
        Ok(self.config.crop_bounds)
    }

    fn set_crop(&mut self, rect: Rect) -> Result<()> {
        self.with_node(|state| state.crops.push(rect));
        Ok(())
    }
}

/// Simulated still encoder producing a short marker-delimited bitstream
pub struct SimEncoder {
    config: SimEncoderConfig,
    shared: Arc<Mutex<SimShared>>,
    input: Vec<u8>,
    input_len: usize,
    physical: Option<PhysAddr>,
    thumbnail: bool,
    output: Vec<u8>,
}

impl EncoderDevice for SimEncoder {
    fn name(&self) -> &str {
        "sim-jpeg"
    }

    fn set_param(&mut self, param: EncoderParam) -> Result<()> {
        if self.config.reject_quality && matches!(param, EncoderParam::Quality(_)) {
            return Err(CameraError::DeviceError(
                "Encoder rejected quality".to_string(),
            ));
        }
        if let EncoderParam::ThumbnailEnabled(enabled) = param {
            self.thumbnail = enabled;
        }
        self.shared.lock().encoder_params.push(param);
        Ok(())
    }

    fn supports_physical_input(&self) -> bool {
        self.config.physical_input
    }

    fn input_buffer(&mut self, len: usize) -> Result<&mut [u8]> {
        self.physical = None;
        self.input.resize(len, 0);
        self.input_len = len;
        Ok(&mut self.input[..len])
    }

    fn set_input_physical(&mut self, y: PhysAddr, _cbcr: PhysAddr) -> Result<()> {
        if !self.config.physical_input {
            return Err(CameraError::EncodeError(
                "Physical input not supported".to_string(),
            ));
        }
        self.physical = Some(y);
        Ok(())
    }

    fn encode(&mut self, _exif: &ExifInfo) -> Result<()> {
        self.output.clear();
        if self.config.fail_encode {
            return Err(CameraError::EncodeError("Simulated encode failure".to_string()));
        }
        let input = match self.physical {
            Some(addr) => SimEncodeInput::Physical(addr),
            None if self.input_len > 0 => SimEncodeInput::Copied(self.input_len),
            None => return Err(CameraError::EncodeError("No input submitted".to_string())),
        };
        self.shared.lock().encodes.push(input);

        self.output.extend_from_slice(&[0xFF, 0xD8]);
        self.output
            .extend_from_slice(&self.input[..self.input_len.min(16)]);
        self.output.extend_from_slice(&[0xFF, 0xD9]);
        Ok(())
    }

    fn output(&self) -> Result<&[u8]> {
        Ok(&self.output)
    }

    fn thumbnail_output(&self) -> Option<&[u8]> {
        if self.thumbnail && !self.output.is_empty() {
            Some(&self.output)
        } else {
            None
        }
    }

    fn close(&mut self) {
        self.input.clear();
        self.input_len = 0;
        self.physical = None;
    }
}
