//! Capture sessions and per-stream state shared by the worker threads
//!
//! Everything here sits behind the orchestrator's hardware lock. The
//! primary session feeds preview and stills; the record session is opened
//! on the first `start_recording`.

use std::mem;
use tracing::{debug, info, warn};

use super::params::PreviewFormat;
use super::settings::SettingsLedger;
use super::sinks::{MemoryAllocator, RecordAddrs, SharedMemory};
use crate::error::Result;
use crate::video::device::ControlId;
use crate::video::format::{PixelFormat, Resolution};
use crate::video::session::CaptureSession;

pub(crate) struct Hardware {
    pub primary: CaptureSession,
    pub record: Option<CaptureSession>,
    pub recording: bool,
    /// Frames still to drop before preview delivery resumes
    pub skip_frames: u32,
    pub preview_format: PreviewFormat,
    pub preview_memory: Option<SharedMemory>,
    pub record_memory: Option<SharedMemory>,
    pub face_detection: bool,
}

impl Hardware {
    pub fn new(primary: CaptureSession) -> Self {
        Self {
            primary,
            record: None,
            recording: false,
            skip_frames: 0,
            preview_format: PreviewFormat::default(),
            preview_memory: None,
            record_memory: None,
            face_detection: false,
        }
    }

    /// Push pending settings to the open sessions
    pub fn flush(&mut self, ledger: &mut SettingsLedger) -> usize {
        ledger.flush_to(&mut self.primary, self.record.as_mut())
    }

    /// Drop at least `frames` upcoming preview frames. Never shortens a
    /// countdown already running.
    pub fn raise_skip(&mut self, frames: u32) {
        if frames > self.skip_frames {
            self.skip_frames = frames;
        }
    }

    pub fn set_face_detection(&mut self, enabled: bool) -> Result<()> {
        if self.face_detection == enabled {
            debug!("Face detection already {}", if enabled { "on" } else { "off" });
            return Ok(());
        }
        self.primary
            .apply_control(ControlId::FaceDetection, enabled as i32)?;
        self.face_detection = enabled;
        info!("Face detection {}", if enabled { "started" } else { "stopped" });
        Ok(())
    }

    /// Point touch focus at a preview pixel, or back to full frame
    pub fn set_focus_position(&mut self, position: Option<(u32, u32)>) -> Result<()> {
        match position {
            Some((x, y)) => {
                self.primary
                    .apply_control(ControlId::ObjectPositionX, x as i32)?;
                self.primary
                    .apply_control(ControlId::ObjectPositionY, y as i32)?;
                self.primary.apply_control(ControlId::TouchAutoFocus, 1)?;
                debug!("Touch focus at ({}, {})", x, y);
            }
            None => {
                self.primary.apply_control(ControlId::TouchAutoFocus, 0)?;
            }
        }
        Ok(())
    }

    /// Stream the record session at `size` and allocate its descriptor
    /// memory. The session must already be open.
    pub fn start_record(
        &mut self,
        size: Resolution,
        buffer_count: u32,
        allocator: &dyn MemoryAllocator,
    ) -> Result<()> {
        let Some(record) = self.record.as_mut() else {
            return Ok(());
        };
        record.negotiate_format(size, PixelFormat::Nv12t)?;
        record.start_streaming(buffer_count)?;
        let memory = match allocator.allocate(mem::size_of::<RecordAddrs>(), record.buffer_count()) {
            Ok(memory) => memory,
            Err(e) => {
                if let Err(stop) = record.stop_streaming() {
                    warn!("{}: stop after failed allocation: {}", record.node(), stop);
                }
                return Err(e);
            }
        };
        self.record_memory = Some(memory);
        self.recording = true;
        info!("Recording started at {}", size);
        Ok(())
    }

    pub fn stop_record(&mut self) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        if let Some(record) = self.record.as_mut() {
            record.stop_streaming()?;
        }
        self.recording = false;
        self.record_memory = None;
        info!("Recording stopped");
        Ok(())
    }

    /// Stop the primary stream and drop the preview memory
    pub fn stop_preview_stream(&mut self) {
        if let Err(e) = self.primary.stop_streaming() {
            warn!("{}: stopping preview stream failed: {}", self.primary.node(), e);
        }
        self.preview_memory = None;
    }

    pub fn close(&mut self) {
        if let Err(e) = self.stop_record() {
            warn!("Stopping record stream on close failed: {}", e);
        }
        if let Some(mut record) = self.record.take() {
            record.close();
        }
        self.primary.close();
        self.preview_memory = None;
    }
}
