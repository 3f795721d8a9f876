//! Preview, record, still and auto-focus orchestration
//!
//! A [`CaptureOrchestrator`] owns the capture sessions of one camera and
//! three worker threads:
//!
//! - preview: parks while preview is stopped, otherwise pulls frames from
//!   the primary session and fans them out to the display sink, the
//!   client preview callback and (while recording) the record callback
//! - auto-focus: parks until `auto_focus` is called, runs one focus
//!   routine and reports the result
//! - picture: spawned per `take_picture`, captures and encodes one still
//!
//! Lock order is state, preview, hardware, display. The focus lock is
//! never held together with another lock. Callbacks run with no lock held,
//! and a preview stop, which waits on the worker, never holds the state lock.

use bytes::Bytes;
use chrono::Local;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::hardware::Hardware;
use super::params::{apply_parameters, CameraParameters, ParameterMap, PreviewFormat};
use super::profile::DeviceProfile;
use super::settings::{FocusMode, SettingsLedger};
use super::sinks::{
    msg, CameraCallbacks, DisplaySink, ErrorCode, HeapAllocator, MemoryAllocator, MemorySlot,
    NoCallbacks, Notification, RecordAddrs,
};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::utils::LogThrottler;
use crate::video::convert::{copy_yuv420p_to_yv12, yuv420p_to_nv21};
use crate::video::device::{ControlId, DeviceBackend, Plane};
use crate::video::encoder::{EncodeBridge, EncodeConfig, EncodeInput, ExifInfo};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::CapturedFrame;
use crate::video::session::{CaptureSession, FrameFormat};

/// Wait after a preview failure that did not itself block
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Throttle key for preview failures, cleared by the next good frame
const PREVIEW_LOG_KEY: &str = "preview";

/// Throttle key for record frames handed back after a stop
const LATE_RELEASE_LOG_KEY: &str = "late_record_release";

const AF_RUNNING: i32 = 0;
const AF_FOCUSED: i32 = 1;
const AF_CANCELLED: i32 = 2;

/// Dominant state of the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Previewing,
    Recording,
    CapturingStill,
    FocusRunning,
}

/// Everything that is currently active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStatus {
    pub previewing: bool,
    /// Preview was started but waits for a display sink
    pub preview_deferred: bool,
    pub recording: bool,
    pub capturing_still: bool,
    pub focus_running: bool,
    pub face_detection: bool,
}

impl CaptureStatus {
    pub fn state(&self) -> CaptureState {
        if self.capturing_still {
            CaptureState::CapturingStill
        } else if self.recording {
            CaptureState::Recording
        } else if self.focus_running {
            CaptureState::FocusRunning
        } else if self.previewing {
            CaptureState::Previewing
        } else {
            CaptureState::Idle
        }
    }
}

/// Out-of-band commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartFaceDetection,
    StopFaceDetection,
}

struct StateData {
    params: CameraParameters,
    ledger: SettingsLedger,
    capture_in_progress: bool,
}

struct PreviewData {
    running: bool,
    deferred: bool,
    exit: bool,
    /// Bumped each time the worker acknowledges a stop
    stop_acks: u64,
}

struct FocusData {
    pending: bool,
    running: bool,
    exit: bool,
}

struct StillImage {
    raw: CapturedFrame,
    compressed: Bytes,
}

struct Inner {
    backend: Arc<dyn DeviceBackend>,
    config: CameraConfig,
    profile: DeviceProfile,
    epoch: Instant,
    msg_enabled: AtomicU32,
    callbacks: RwLock<Arc<dyn CameraCallbacks>>,
    allocator: RwLock<Arc<dyn MemoryAllocator>>,
    throttler: LogThrottler,

    state: Mutex<StateData>,
    preview: Mutex<PreviewData>,
    preview_cond: Condvar,
    preview_stopped: Condvar,
    preview_worker: OnceLock<ThreadId>,
    hw: Mutex<Hardware>,
    display: Mutex<Option<Box<dyn DisplaySink>>>,
    focus: Mutex<FocusData>,
    focus_cond: Condvar,
}

/// One open camera
pub struct CaptureOrchestrator {
    inner: Arc<Inner>,
    preview_thread: Option<JoinHandle<()>>,
    focus_thread: Option<JoinHandle<()>>,
    picture_thread: Mutex<Option<JoinHandle<()>>>,
    released: bool,
}

impl CaptureOrchestrator {
    /// Open the primary session described by `config` and start the
    /// preview and auto-focus workers
    pub fn open(backend: Arc<dyn DeviceBackend>, config: CameraConfig) -> Result<Self> {
        config.validate()?;
        let profile = DeviceProfile::for_facing(config.facing);
        let primary = CaptureSession::open(
            backend.as_ref(),
            &config.device,
            profile.input(),
            config.frame_timeout(),
        )?;

        let inner = Arc::new(Inner {
            backend,
            profile,
            epoch: Instant::now(),
            msg_enabled: AtomicU32::new(0),
            callbacks: RwLock::new(Arc::new(NoCallbacks)),
            allocator: RwLock::new(Arc::new(HeapAllocator)),
            throttler: LogThrottler::default(),
            state: Mutex::new(StateData {
                params: CameraParameters::defaults(profile),
                ledger: SettingsLedger::new(profile),
                capture_in_progress: false,
            }),
            preview: Mutex::new(PreviewData {
                running: false,
                deferred: false,
                exit: false,
                stop_acks: 0,
            }),
            preview_cond: Condvar::new(),
            preview_stopped: Condvar::new(),
            preview_worker: OnceLock::new(),
            hw: Mutex::new(Hardware::new(primary)),
            display: Mutex::new(None),
            focus: Mutex::new(FocusData {
                pending: false,
                running: false,
                exit: false,
            }),
            focus_cond: Condvar::new(),
            config,
        });

        let mut orchestrator = Self {
            inner: inner.clone(),
            preview_thread: None,
            focus_thread: None,
            picture_thread: Mutex::new(None),
            released: false,
        };
        orchestrator.preview_thread = Some(spawn_worker("camera-preview", &inner, |i| {
            i.preview_loop()
        })?);
        orchestrator.focus_thread = Some(spawn_worker("camera-focus", &inner, |i| i.focus_loop())?);

        info!(
            "Opened {} camera on {} (input {})",
            profile,
            inner.config.device,
            profile.input()
        );
        Ok(orchestrator)
    }

    pub fn profile(&self) -> DeviceProfile {
        self.inner.profile
    }

    pub fn config(&self) -> &CameraConfig {
        &self.inner.config
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn CameraCallbacks>) {
        *self.inner.callbacks.write() = callbacks;
    }

    pub fn set_allocator(&self, allocator: Arc<dyn MemoryAllocator>) {
        *self.inner.allocator.write() = allocator;
    }

    pub fn enable_msg_type(&self, mask: u32) {
        self.inner.msg_enabled.fetch_or(mask, Ordering::SeqCst);
    }

    pub fn disable_msg_type(&self, mask: u32) {
        self.inner.msg_enabled.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Any type in `mask` is enabled
    pub fn msg_type_enabled(&self, mask: u32) -> bool {
        self.inner.msg_enabled(mask)
    }

    /// Attach or detach the display sink.
    ///
    /// A running preview is stopped by a window change. A start that was
    /// deferred for lack of a window completes here.
    pub fn set_preview_window(&self, window: Option<Box<dyn DisplaySink>>) -> Result<()> {
        let inner = &self.inner;
        let Some(mut window) = window else {
            *inner.display.lock() = None;
            debug!("Preview window detached");
            return Ok(());
        };

        // The stop waits on the preview worker, so it runs without the state lock
        let (mut st, mut p) = loop {
            {
                let mut p = inner.preview.lock();
                if p.running && !p.deferred {
                    info!("Stopping preview for window change");
                    inner.stop_preview_l(&mut p);
                }
            }
            let st = inner.state.lock();
            let p = inner.preview.lock();
            if !p.running || p.deferred {
                break (st, p);
            }
        };

        window.set_geometry(st.params.preview_size)?;
        *inner.display.lock() = Some(window);

        if p.running && p.deferred {
            if let Err(e) = inner.start_preview_l(&mut st) {
                p.running = false;
                p.deferred = false;
                return Err(e);
            }
            p.deferred = false;
            inner.preview_cond.notify_all();
        }
        Ok(())
    }

    /// Start preview. Without a display sink the start is recorded and
    /// completed by [`set_preview_window`](Self::set_preview_window).
    pub fn start_preview(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.capture_in_progress {
            return Err(CameraError::Busy("still capture in progress".to_string()));
        }

        let mut p = inner.preview.lock();
        if p.exit {
            return Err(CameraError::InvalidOperation("camera is released".to_string()));
        }
        if p.running {
            return Err(CameraError::InvalidOperation(
                "preview already running".to_string(),
            ));
        }

        p.running = true;
        p.deferred = false;
        if inner.display.lock().is_none() {
            debug!("No preview window yet, deferring preview start");
            p.deferred = true;
            return Ok(());
        }

        match inner.start_preview_l(&mut st) {
            Ok(()) => {
                inner.preview_cond.notify_all();
                Ok(())
            }
            Err(e) => {
                p.running = false;
                Err(e)
            }
        }
    }

    /// Stop preview and wait for the preview worker to acknowledge.
    /// Does nothing when preview is not running.
    pub fn stop_preview(&self) {
        let mut p = self.inner.preview.lock();
        self.inner.stop_preview_l(&mut p);
    }

    pub fn preview_enabled(&self) -> bool {
        self.inner.preview.lock().running
    }

    /// Start streaming the record session. Idempotent.
    pub fn start_recording(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        let mut hw = inner.hw.lock();
        if hw.recording {
            return Ok(());
        }

        if hw.record.is_none() {
            let node = inner.config.record_device.as_deref().ok_or_else(|| {
                CameraError::DeviceUnavailable("no record device configured".to_string())
            })?;
            hw.record = Some(CaptureSession::open(
                inner.backend.as_ref(),
                node,
                inner.profile.input(),
                inner.config.frame_timeout(),
            )?);
        }

        let allocator = inner.allocator();
        hw.start_record(
            st.params.recording_size(),
            inner.config.buffer_count,
            allocator.as_ref(),
        )?;
        // Re-send everything so the zoom crop reaches the record session
        st.ledger.invalidate();
        inner.throttler.clear(LATE_RELEASE_LOG_KEY);
        Ok(())
    }

    /// Stop the record stream. Idempotent.
    pub fn stop_recording(&self) -> Result<()> {
        self.inner.hw.lock().stop_record()
    }

    pub fn recording_enabled(&self) -> bool {
        self.inner.hw.lock().recording
    }

    /// Hand record buffer `index` back to the driver after the consumer
    /// is done with it
    pub fn release_recording_frame(&self, index: usize) -> Result<()> {
        let mut hw = self.inner.hw.lock();
        if !hw.recording {
            // A consumer draining its queue after a stop releases every slot
            crate::info_throttled!(
                self.inner.throttler,
                LATE_RELEASE_LOG_KEY,
                "Record frame {} released after recording stopped",
                index
            );
            return Ok(());
        }
        match hw.record.as_mut() {
            Some(record) => record.release_frame(index),
            None => Ok(()),
        }
    }

    /// Request one focus run
    pub fn auto_focus(&self) -> Result<()> {
        let mut f = self.inner.focus.lock();
        if f.exit {
            return Err(CameraError::InvalidOperation("camera is released".to_string()));
        }
        f.pending = true;
        self.inner.focus_cond.notify_all();
        Ok(())
    }

    /// Withdraw a requested focus run and ask the device to stop focusing.
    ///
    /// A run already in progress completes and reports normally.
    pub fn cancel_auto_focus(&self) -> Result<()> {
        let running = {
            let mut f = self.inner.focus.lock();
            f.pending = false;
            f.running
        };
        if running && self.inner.profile.has_autofocus() {
            self.inner
                .hw
                .lock()
                .primary
                .apply_control(ControlId::AutoFocusStart, 0)?;
            debug!("Auto-focus stop requested");
        }
        Ok(())
    }

    /// Stop preview and capture one still on a dedicated thread.
    ///
    /// Fails with `Busy` while a previous capture has not finished.
    pub fn take_picture(&self) -> Result<()> {
        self.stop_preview();

        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.capture_in_progress {
            return Err(CameraError::Busy("capture already in progress".to_string()));
        }

        let mut slot = self.picture_thread.lock();
        if let Some(previous) = slot.take() {
            join_worker(previous, "picture");
        }
        *slot = Some(spawn_worker("camera-picture", inner, |i| i.picture_worker())?);
        st.capture_in_progress = true;
        Ok(())
    }

    /// Wait for an outstanding picture worker
    pub fn cancel_picture(&self) -> Result<()> {
        let handle = self.picture_thread.lock().take();
        if let Some(handle) = handle {
            join_worker(handle, "picture");
        }
        Ok(())
    }

    /// Apply a client parameter update.
    ///
    /// Valid keys are committed even when others are rejected; the error
    /// then names every rejected key. A preview geometry change restarts a
    /// running preview.
    pub fn set_parameters(&self, map: &ParameterMap) -> Result<()> {
        let inner = &self.inner;
        let changes = {
            let mut guard = inner.state.lock();
            if guard.capture_in_progress {
                return Err(CameraError::Busy("still capture in progress".to_string()));
            }
            let st = &mut *guard;
            apply_parameters(&mut st.params, &mut st.ledger, map)
        };

        if changes.effect_changed || changes.focus_position.is_some() {
            let mut hw = inner.hw.lock();
            if changes.effect_changed {
                hw.raise_skip(inner.config.effect_skip_frames);
            }
            if let Some(position) = changes.focus_position {
                if let Err(e) = hw.set_focus_position(position) {
                    warn!("Touch focus update failed: {}", e);
                }
            }
        }

        if changes.preview_changed {
            inner.restart_preview()?;
        }

        match changes.rejection_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current parameters with the capability keys
    pub fn get_parameters(&self) -> ParameterMap {
        let st = self.inner.state.lock();
        ParameterMap::from_parameters(&st.params, self.inner.profile)
    }

    pub fn parameters(&self) -> CameraParameters {
        self.inner.state.lock().params.clone()
    }

    /// Face detection commands; preview must be running
    pub fn send_command(&self, command: Command) -> Result<()> {
        let p = self.inner.preview.lock();
        if !p.running || p.deferred {
            return Err(CameraError::InvalidOperation(format!(
                "{:?} needs a running preview",
                command
            )));
        }
        let mut hw = self.inner.hw.lock();
        match command {
            Command::StartFaceDetection => hw.set_face_detection(true),
            Command::StopFaceDetection => hw.set_face_detection(false),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        let inner = &self.inner;
        let capturing_still = inner.state.lock().capture_in_progress;
        let (previewing, preview_deferred) = {
            let p = inner.preview.lock();
            (p.running && !p.deferred, p.running && p.deferred)
        };
        let (recording, face_detection) = {
            let hw = inner.hw.lock();
            (hw.recording, hw.face_detection)
        };
        let focus_running = {
            let f = inner.focus.lock();
            f.running || f.pending
        };
        CaptureStatus {
            previewing,
            preview_deferred,
            recording,
            capturing_still,
            focus_running,
            face_detection,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.status().state()
    }

    /// Stop every worker and close the device sessions. Safe to call more
    /// than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        let inner = &self.inner;

        if let Some(handle) = self.preview_thread.take() {
            {
                let mut p = inner.preview.lock();
                p.exit = true;
                // A parked worker only wakes into the exit check when running
                p.running = true;
                p.deferred = false;
                inner.preview_cond.notify_all();
            }
            join_worker(handle, "preview");
        }

        if let Some(handle) = self.focus_thread.take() {
            {
                let mut f = inner.focus.lock();
                f.exit = true;
                inner.focus_cond.notify_all();
            }
            join_worker(handle, "auto-focus");
        }

        if let Some(handle) = self.picture_thread.lock().take() {
            join_worker(handle, "picture");
        }

        inner.preview.lock().running = false;
        inner.hw.lock().close();
        *inner.display.lock() = None;
        self.released = true;
        info!("Released {} camera", inner.profile);
    }
}

impl Drop for CaptureOrchestrator {
    fn drop(&mut self) {
        self.release();
    }
}

fn spawn_worker(
    name: &str,
    inner: &Arc<Inner>,
    body: impl FnOnce(&Inner) + Send + 'static,
) -> Result<JoinHandle<()>> {
    let inner = inner.clone();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&inner))
        .map_err(|e| CameraError::ResourceError(format!("Failed to spawn {}: {}", name, e)))
}

fn join_worker(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        error!("{} worker panicked", name);
    }
}

/// Copy one planar frame into the next display buffer
fn present(sink: &mut dyn DisplaySink, frame: &[u8], resolution: Resolution) -> Result<()> {
    let slot = sink.dequeue_buffer()?;
    let written = sink
        .lock_buffer(slot)
        .and_then(|dst| copy_yuv420p_to_yv12(frame, resolution, dst));
    match written {
        Ok(()) => {
            sink.unlock_buffer(slot)?;
            sink.enqueue_buffer(slot)
        }
        Err(e) => {
            let _ = sink.unlock_buffer(slot);
            if let Err(cancel) = sink.cancel_buffer(slot) {
                debug!("Cancelling display buffer {} failed: {}", slot, cancel);
            }
            Err(e)
        }
    }
}

impl Inner {
    fn msg_enabled(&self, mask: u32) -> bool {
        self.msg_enabled.load(Ordering::SeqCst) & mask != 0
    }

    fn callbacks(&self) -> Arc<dyn CameraCallbacks> {
        self.callbacks.read().clone()
    }

    fn allocator(&self) -> Arc<dyn MemoryAllocator> {
        self.allocator.read().clone()
    }

    /// Configure and stream the primary session for preview. Caller holds
    /// the state and preview locks; this never waits on the preview worker.
    fn start_preview_l(&self, st: &mut StateData) -> Result<()> {
        let size = st.params.preview_size;
        let mut guard = self.hw.lock();
        let hw = &mut *guard;

        hw.stop_preview_stream();
        hw.primary.negotiate_format(size, PixelFormat::Yuv420)?;
        st.ledger.invalidate();
        let failures = hw.flush(&mut st.ledger);
        if failures > 0 {
            warn!("{} settings were not applied at preview start", failures);
        }
        hw.primary.start_streaming(self.config.buffer_count)?;

        let frame_size = FrameFormat::new(size, PixelFormat::Yuv420).frame_size();
        let memory = match self
            .allocator()
            .allocate(frame_size, hw.primary.buffer_count())
        {
            Ok(memory) => memory,
            Err(e) => {
                hw.stop_preview_stream();
                return Err(e);
            }
        };
        if let Some(sink) = self.display.lock().as_mut() {
            if let Err(e) = sink.set_geometry(size) {
                hw.stop_preview_stream();
                return Err(e);
            }
        }

        hw.preview_memory = Some(memory);
        hw.preview_format = st.params.preview_format;
        hw.raise_skip(self.config.initial_skip_frames);
        info!("Preview started at {} ({})", size, st.params.preview_format);
        Ok(())
    }

    /// Stop a streaming preview and start it again with the current
    /// parameters. Called without the state lock; the stop waits on the
    /// preview worker, whose callbacks may read the state.
    fn restart_preview(&self) -> Result<()> {
        {
            let mut p = self.preview.lock();
            if !p.running || p.deferred {
                return Ok(());
            }
            self.stop_preview_l(&mut p);
        }

        let mut st = self.state.lock();
        let mut p = self.preview.lock();
        if p.running || p.exit || st.capture_in_progress {
            debug!("Preview changed hands during restart, leaving it");
            return Ok(());
        }
        info!(
            "Restarting preview at {} ({})",
            st.params.preview_size, st.params.preview_format
        );
        p.running = true;
        if let Err(e) = self.start_preview_l(&mut st) {
            p.running = false;
            return Err(e);
        }
        self.preview_cond.notify_all();
        Ok(())
    }

    /// Caller holds the preview lock and not the state lock
    fn stop_preview_l(&self, p: &mut MutexGuard<'_, PreviewData>) {
        if !p.running {
            debug!("Preview not running, nothing to stop");
            return;
        }

        {
            let mut hw = self.hw.lock();
            if hw.face_detection {
                if let Err(e) = hw.set_face_detection(false) {
                    warn!("Stopping face detection failed: {}", e);
                }
            }
        }

        p.running = false;
        if p.exit {
            return;
        }
        if p.deferred {
            debug!("Deferred preview start withdrawn");
            p.deferred = false;
            return;
        }
        if self.preview_worker.get() == Some(&thread::current().id()) {
            // Called from a preview callback; the worker parks on its next pass
            return;
        }

        let ack = p.stop_acks;
        self.preview_cond.notify_all();
        while p.stop_acks == ack {
            self.preview_stopped.wait(p);
        }
        debug!("Preview stopped");
    }

    fn preview_loop(&self) {
        let _ = self.preview_worker.set(thread::current().id());
        debug!("Preview worker started");
        loop {
            let mut p = self.preview.lock();
            while !p.exit && (!p.running || p.deferred) {
                self.hw.lock().stop_preview_stream();
                p.stop_acks += 1;
                self.preview_stopped.notify_all();
                self.preview_cond.wait(&mut p);
            }
            if p.exit {
                drop(p);
                self.hw.lock().stop_preview_stream();
                debug!("Preview worker exiting");
                return;
            }
            drop(p);

            match self.preview_frame() {
                Ok(()) => self.throttler.clear(PREVIEW_LOG_KEY),
                Err(e) => self.on_preview_error(e),
            }
        }
    }

    /// Pull one frame and fan it out
    fn preview_frame(&self) -> Result<()> {
        if let Some(mut st) = self.state.try_lock() {
            if st.ledger.is_dirty() {
                self.hw.lock().flush(&mut st.ledger);
            }
        }

        let (timestamp, preview_slot, record_slot) = {
            let mut guard = self.hw.lock();
            let hw = &mut *guard;
            let index = hw.primary.acquire_frame()?;
            if hw.skip_frames > 0 {
                hw.skip_frames -= 1;
                return hw.primary.release_frame(index);
            }
            let timestamp = self.epoch.elapsed();

            let delivered = match hw.primary.format() {
                Some(format) => self.deliver_preview(hw, index, format.resolution),
                None => Err(CameraError::InvalidOperation(
                    "preview stream has no format".to_string(),
                )),
            };
            let released = hw.primary.release_frame(index);
            let preview_slot = delivered?;
            released?;

            let record_slot = if hw.recording {
                self.record_frame(hw)?
            } else {
                None
            };
            (timestamp, preview_slot, record_slot)
        };

        let callbacks = self.callbacks();
        if let Some(slot) = preview_slot {
            callbacks.on_preview_frame(slot);
        }
        if let Some(slot) = record_slot {
            callbacks.on_record_frame(timestamp, slot);
        }
        Ok(())
    }

    fn deliver_preview(
        &self,
        hw: &Hardware,
        index: usize,
        resolution: Resolution,
    ) -> Result<Option<MemorySlot>> {
        let frame = hw.primary.buffer_at(index).payload();

        if let Some(sink) = self.display.lock().as_mut() {
            match present(sink.as_mut(), frame, resolution) {
                Ok(()) => self.throttler.clear("display"),
                Err(e) => {
                    crate::warn_throttled!(self.throttler, "display", "Display update failed: {}", e)
                }
            }
        }

        if !self.msg_enabled(msg::PREVIEW_FRAME) {
            return Ok(None);
        }
        let Some(memory) = hw.preview_memory.clone() else {
            return Ok(None);
        };
        let nv21 = hw.preview_format == PreviewFormat::Yuv420sp;
        memory.with_slot_mut(index, |dst| {
            if nv21 {
                yuv420p_to_nv21(frame, resolution, dst)
            } else {
                let len = frame.len().min(dst.len());
                dst[..len].copy_from_slice(&frame[..len]);
                Ok(())
            }
        })??;
        Ok(Some(MemorySlot { memory, index }))
    }

    /// Pull one record frame and describe it in the record memory
    fn record_frame(&self, hw: &mut Hardware) -> Result<Option<MemorySlot>> {
        let Some(record) = hw.record.as_mut() else {
            return Ok(None);
        };
        let index = record.acquire_frame()?;

        let y = record.physical_address(index, Plane::Y);
        let cbcr = record.physical_address(index, Plane::CbCr);
        if !y.is_valid() || !cbcr.is_valid() {
            record.release_frame(index)?;
            return Err(CameraError::DeviceError(format!(
                "No physical address for record buffer {} ({} / {})",
                index, y, cbcr
            )));
        }

        let Some(memory) = hw.record_memory.clone() else {
            record.release_frame(index)?;
            return Ok(None);
        };
        let addrs = RecordAddrs::new(y, cbcr, index);
        if let Err(e) = memory.write_slot(index, bytemuck::bytes_of(&addrs)) {
            record.release_frame(index)?;
            return Err(e);
        }

        if self.msg_enabled(msg::VIDEO_FRAME) {
            Ok(Some(MemorySlot { memory, index }))
        } else {
            record.release_frame(index)?;
            Ok(None)
        }
    }

    fn on_preview_error(&self, e: CameraError) {
        crate::error_throttled!(
            self.throttler,
            PREVIEW_LOG_KEY,
            "Preview frame failed ({}): {}",
            e.kind(),
            e
        );
        if matches!(e, CameraError::CaptureTimeout { .. }) {
            return;
        }
        let mut p = self.preview.lock();
        if p.running && !p.exit {
            self.preview_cond.wait_for(&mut p, ERROR_BACKOFF);
        }
    }

    fn focus_loop(&self) {
        debug!("Auto-focus worker started");
        loop {
            {
                let mut f = self.focus.lock();
                while !f.pending && !f.exit {
                    self.focus_cond.wait(&mut f);
                }
                if f.exit {
                    debug!("Auto-focus worker exiting");
                    return;
                }
                f.pending = false;
                f.running = true;
            }

            let outcome = self.run_focus();

            let exiting = {
                let mut f = self.focus.lock();
                f.running = false;
                f.exit
            };
            if exiting {
                return;
            }
            let focused = outcome.unwrap_or_else(|e| {
                warn!("Auto-focus failed: {}", e);
                false
            });
            if self.msg_enabled(msg::FOCUS) {
                self.callbacks().notify(Notification::Focus(focused));
            }
        }
    }

    /// One bounded focus run; `Ok(true)` when focus was reached
    fn run_focus(&self) -> Result<bool> {
        let mode = self.state.lock().params.focus_mode;
        if !self.profile.has_autofocus() || !matches!(mode, FocusMode::Auto | FocusMode::Macro) {
            debug!("Focus mode {} needs no focus run", mode);
            return Ok(true);
        }

        self.hw
            .lock()
            .primary
            .apply_control(ControlId::AutoFocusStart, 1)?;
        let deadline = Instant::now() + self.config.autofocus_timeout();

        loop {
            let status = self
                .hw
                .lock()
                .primary
                .read_control(ControlId::AutoFocusResult)?;
            if status != AF_RUNNING {
                debug!("Auto-focus finished with status {}", status);
                return Ok(matches!(status, AF_FOCUSED | AF_CANCELLED));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Auto-focus did not settle within {:?}",
                    self.config.autofocus_timeout()
                );
                if let Err(e) = self
                    .hw
                    .lock()
                    .primary
                    .apply_control(ControlId::AutoFocusStart, 0)
                {
                    debug!("Stopping timed out auto-focus failed: {}", e);
                }
                return Ok(false);
            }

            let mut f = self.focus.lock();
            if f.exit {
                return Ok(false);
            }
            let wait = self.config.autofocus_poll_interval().min(deadline - now);
            self.focus_cond.wait_for(&mut f, wait);
        }
    }

    fn picture_worker(&self) {
        match self.capture_still() {
            Ok(still) => self.deliver_still(still),
            Err(e) => {
                error!("Still capture failed: {}", e);
                if self.msg_enabled(msg::ERROR) {
                    self.callbacks().notify(Notification::Error(ErrorCode::Unknown));
                }
            }
        }
        self.state.lock().capture_in_progress = false;
    }

    fn capture_still(&self) -> Result<StillImage> {
        let mut st = self.state.lock();
        let params = st.params.clone();
        let mut guard = self.hw.lock();
        let hw = &mut *guard;

        hw.stop_preview_stream();
        hw.primary
            .negotiate_format(params.picture_size, params.picture_format.capture_format())?;
        let failures = hw.flush(&mut st.ledger);
        if failures > 0 {
            warn!("{} settings were not applied before capture", failures);
        }
        drop(st);

        let result = self.snapshot(&mut hw.primary, &params);

        if let Err(e) = hw.primary.stop_streaming() {
            warn!("Stopping still stream failed: {}", e);
        }
        if let Err(e) = hw.primary.apply_control(ControlId::StreamPause, 0) {
            debug!("Stream pause failed: {}", e);
        }
        result
    }

    fn snapshot(&self, session: &mut CaptureSession, params: &CameraParameters) -> Result<StillImage> {
        session.start_streaming(1)?;
        let index = session.acquire_frame()?;
        let result = self.encode_still(session, index, params);
        if let Err(e) = session.release_frame(index) {
            debug!("Releasing still buffer failed: {}", e);
        }
        result
    }

    fn encode_still(
        &self,
        session: &mut CaptureSession,
        index: usize,
        params: &CameraParameters,
    ) -> Result<StillImage> {
        let format = params.picture_format.capture_format();
        let mut raw = CapturedFrame::copy_from(
            session.buffer_at(index).payload(),
            params.picture_size,
            format,
            session.last_sequence(),
            self.epoch.elapsed(),
        );

        if format == PixelFormat::Jpeg {
            let size = session.read_control(ControlId::JpegMainSize)?;
            if size <= 0 || size as usize > raw.len() {
                return Err(CameraError::DeviceError(format!(
                    "Sensor reported JPEG size {} for a {} byte buffer",
                    size,
                    raw.len()
                )));
            }
            raw.truncate(size as usize);
            if !raw.is_valid_jpeg() {
                warn!("Sensor JPEG lacks SOI/EOI markers");
            }
            let compressed = raw.data_bytes();
            debug!("Sensor produced {} byte JPEG", compressed.len());
            return Ok(StillImage { raw, compressed });
        }

        let mut bridge = EncodeBridge::open(self.backend.as_ref())?;
        let thumbnail = params.thumbnail();
        let mut config = EncodeConfig::new(params.picture_size, format, params.jpeg_quality);
        if let Some(size) = thumbnail {
            config = config.with_thumbnail(size, params.thumbnail_quality);
        }
        bridge.configure(&config)?;

        let mut exif = ExifInfo::new(params.picture_size, params.rotation, Local::now());
        exif.gps = params.gps_info();
        exif.thumbnail = thumbnail;
        exif.focal_length = self.profile.focal_length();

        let physical = if self.config.zero_copy && bridge.supports_physical_input() {
            let y = session.physical_address(index, Plane::Y);
            let cbcr = session.physical_address(index, Plane::CbCr);
            (y.is_valid() && cbcr.is_valid()).then_some((y, cbcr))
        } else {
            None
        };
        let input = match physical {
            Some((y, cbcr)) => EncodeInput::Physical { y, cbcr },
            None => EncodeInput::Frame(raw.data()),
        };

        let encoded = bridge.encode(input, &exif)?;
        let compressed = Bytes::copy_from_slice(encoded.data);
        debug!(
            "Encoded {} {} still into {} bytes ({})",
            params.picture_size,
            format,
            compressed.len(),
            if physical.is_some() { "zero-copy" } else { "copied" }
        );
        Ok(StillImage { raw, compressed })
    }

    /// Shutter first, then the data callbacks
    fn deliver_still(&self, still: StillImage) {
        let callbacks = self.callbacks();
        if self.msg_enabled(msg::SHUTTER) {
            callbacks.notify(Notification::Shutter);
        }
        if self.msg_enabled(msg::RAW_IMAGE) {
            callbacks.on_raw_image(&still.raw);
        }
        if self.msg_enabled(msg::COMPRESSED_IMAGE) {
            callbacks.on_compressed_image(still.compressed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::sinks::MemoryDisplay;
    use crate::video::frame::is_valid_jpeg;
    use crate::video::sim::{SimBackend, SimConfig, SimEncodeInput, SimEncoderConfig, SIM_JPEG_LEN};
    use std::sync::atomic::AtomicUsize;

    const PRIMARY: &str = "/dev/video0";
    const RECORD: &str = "/dev/video2";

    fn test_config() -> CameraConfig {
        CameraConfig {
            device: PRIMARY.to_string(),
            record_device: Some(RECORD.to_string()),
            frame_timeout_ms: 1000,
            autofocus_timeout_ms: 500,
            autofocus_poll_ms: 5,
            ..CameraConfig::default()
        }
    }

    fn open_with(backend: &SimBackend, config: CameraConfig) -> CaptureOrchestrator {
        CaptureOrchestrator::open(Arc::new(backend.clone()), config).unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<Notification>>,
        preview_frames: AtomicUsize,
        first_preview: Mutex<Option<(usize, Bytes)>>,
        raw: Mutex<Vec<CapturedFrame>>,
        compressed: Mutex<Vec<Bytes>>,
        record_frames: Mutex<Vec<(Duration, RecordAddrs)>>,
        /// Block inside the shutter callback until opened
        shutter_gate: Option<Gate>,
    }

    struct Gate {
        state: Mutex<(bool, bool)>,
        cond: Condvar,
    }

    impl Gate {
        fn new() -> Self {
            Self {
                state: Mutex::new((false, false)),
                cond: Condvar::new(),
            }
        }

        fn enter_and_wait(&self) {
            let mut state = self.state.lock();
            state.0 = true;
            self.cond.notify_all();
            while !state.1 {
                self.cond.wait(&mut state);
            }
        }

        fn wait_entered(&self) {
            let mut state = self.state.lock();
            while !state.0 {
                self.cond.wait(&mut state);
            }
        }

        fn open(&self) {
            self.state.lock().1 = true;
            self.cond.notify_all();
        }
    }

    impl CameraCallbacks for Recorder {
        fn notify(&self, event: Notification) {
            self.notifications.lock().push(event);
            if event == Notification::Shutter {
                if let Some(gate) = &self.shutter_gate {
                    gate.enter_and_wait();
                }
            }
        }

        fn on_preview_frame(&self, frame: MemorySlot) {
            self.preview_frames.fetch_add(1, Ordering::SeqCst);
            let mut first = self.first_preview.lock();
            if first.is_none() {
                *first = Some((frame.index, frame.to_bytes().unwrap()));
            }
        }

        fn on_raw_image(&self, frame: &CapturedFrame) {
            self.raw.lock().push(frame.clone());
        }

        fn on_compressed_image(&self, data: Bytes) {
            self.compressed.lock().push(data);
        }

        fn on_record_frame(&self, timestamp: Duration, frame: MemorySlot) {
            let addrs = frame.record_addrs().unwrap();
            self.record_frames.lock().push((timestamp, addrs));
        }
    }

    fn start_preview_with_display(camera: &CaptureOrchestrator) -> Arc<std::sync::atomic::AtomicU64> {
        let display = MemoryDisplay::new(3);
        let presented = display.presented();
        camera.set_preview_window(Some(Box::new(display))).unwrap();
        camera.start_preview().unwrap();
        presented
    }

    fn wait_capture_done(camera: &CaptureOrchestrator) {
        assert!(wait_until(|| !camera.status().capturing_still));
        camera.cancel_picture().unwrap();
    }

    #[test]
    fn test_preview_delivers_frames() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::PREVIEW_FRAME);

        let presented = start_preview_with_display(&camera);
        assert_eq!(camera.state(), CaptureState::Previewing);
        assert!(wait_until(|| presented.load(Ordering::Relaxed) >= 3
            && recorder.preview_frames.load(Ordering::SeqCst) >= 3));

        let (index, data) = recorder.first_preview.lock().clone().unwrap();
        let expected = FrameFormat::new(Resolution::VGA, PixelFormat::Yuv420).frame_size();
        assert_eq!(data.len(), expected);
        // Uniform planes survive the NV21 repack unchanged
        assert!(data.iter().all(|&b| b == SimBackend::pattern_byte(index)));

        let node = backend.node_state(PRIMARY);
        assert_eq!(node.format, Some((Resolution::VGA, PixelFormat::Yuv420)));
        assert_eq!(node.input, Some(0));
        assert_eq!(node.frame_rate, Some(30));

        camera.stop_preview();
        assert_eq!(camera.state(), CaptureState::Idle);
        assert_eq!(backend.node_state(PRIMARY).stream_offs, 1);
    }

    #[test]
    fn test_preview_start_deferred_until_window() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());

        camera.start_preview().unwrap();
        let status = camera.status();
        assert!(status.preview_deferred);
        assert!(!status.previewing);
        assert_eq!(backend.node_state(PRIMARY).stream_ons, 0);

        let display = MemoryDisplay::new(2);
        let presented = display.presented();
        camera.set_preview_window(Some(Box::new(display))).unwrap();
        assert!(camera.status().previewing);
        assert_eq!(backend.node_state(PRIMARY).stream_ons, 1);
        assert!(wait_until(|| presented.load(Ordering::Relaxed) >= 1));
    }

    #[test]
    fn test_stop_preview_when_never_started() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        camera.stop_preview();
        camera.stop_preview();
        assert_eq!(camera.status(), CaptureStatus::default());
        assert_eq!(camera.state(), CaptureState::Idle);
    }

    #[test]
    fn test_start_preview_twice_is_invalid() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        start_preview_with_display(&camera);
        assert!(matches!(
            camera.start_preview(),
            Err(CameraError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_window_change_stops_preview() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        start_preview_with_display(&camera);

        camera
            .set_preview_window(Some(Box::new(MemoryDisplay::new(2))))
            .unwrap();
        assert!(!camera.preview_enabled());
        camera.start_preview().unwrap();
        assert!(camera.status().previewing);
    }

    #[test]
    fn test_second_take_picture_is_busy() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder {
            shutter_gate: Some(Gate::new()),
            ..Recorder::default()
        });
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::SHUTTER | msg::COMPRESSED_IMAGE);

        camera.take_picture().unwrap();
        let gate = recorder.shutter_gate.as_ref().unwrap();
        gate.wait_entered();

        assert_eq!(camera.state(), CaptureState::CapturingStill);
        assert!(matches!(camera.take_picture(), Err(CameraError::Busy(_))));
        assert!(matches!(
            camera.set_parameters(&ParameterMap::new()),
            Err(CameraError::Busy(_))
        ));
        assert!(matches!(camera.start_preview(), Err(CameraError::Busy(_))));

        gate.open();
        wait_capture_done(&camera);
        assert_eq!(recorder.compressed.lock().len(), 1);
        assert_eq!(
            recorder.notifications.lock().as_slice(),
            &[Notification::Shutter]
        );
    }

    #[test]
    fn test_sensor_jpeg_picture() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::ALL);

        start_preview_with_display(&camera);
        camera.take_picture().unwrap();
        wait_capture_done(&camera);

        assert!(!camera.preview_enabled());
        let compressed = recorder.compressed.lock();
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].len(), SIM_JPEG_LEN);
        assert!(is_valid_jpeg(&compressed[0]));
        assert_eq!(recorder.raw.lock()[0].format, PixelFormat::Jpeg);
        assert!(backend.encodes().is_empty());

        let node = backend.node_state(PRIMARY);
        assert_eq!(
            node.format,
            Some((Resolution::new(2560, 1920), PixelFormat::Jpeg))
        );
        assert_eq!(node.controls.get(&ControlId::StreamPause), Some(&0));
    }

    fn yuv_picture_params() -> ParameterMap {
        let mut map = ParameterMap::new();
        map.set("picture-format", "yuv420sp");
        map.set("picture-size", "640x480");
        map
    }

    #[test]
    fn test_encoded_picture_uses_physical_address() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::COMPRESSED_IMAGE);

        camera.set_parameters(&yuv_picture_params()).unwrap();
        camera.take_picture().unwrap();
        wait_capture_done(&camera);

        assert_eq!(
            backend.encodes(),
            vec![SimEncodeInput::Physical(SimBackend::phys_addr(0))]
        );
        assert!(is_valid_jpeg(&recorder.compressed.lock()[0]));
        assert_eq!(
            backend.node_state(PRIMARY).format,
            Some((Resolution::VGA, PixelFormat::Nv21))
        );
    }

    #[test]
    fn test_encoded_picture_copies_without_zero_copy() {
        let backend = SimBackend::new();
        let config = CameraConfig {
            zero_copy: false,
            ..test_config()
        };
        let camera = open_with(&backend, config);
        camera.set_parameters(&yuv_picture_params()).unwrap();
        camera.take_picture().unwrap();
        wait_capture_done(&camera);

        let expected = PixelFormat::Nv21.frame_size(Resolution::VGA).unwrap();
        assert_eq!(backend.encodes(), vec![SimEncodeInput::Copied(expected)]);
    }

    #[test]
    fn test_encode_failure_reports_error() {
        let backend = SimBackend::with_config(
            SimConfig::default(),
            SimEncoderConfig {
                fail_encode: true,
                ..SimEncoderConfig::default()
            },
        );
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::ERROR | msg::COMPRESSED_IMAGE);

        camera.set_parameters(&yuv_picture_params()).unwrap();
        camera.take_picture().unwrap();
        wait_capture_done(&camera);

        assert!(recorder.compressed.lock().is_empty());
        assert_eq!(
            recorder.notifications.lock().as_slice(),
            &[Notification::Error(ErrorCode::Unknown)]
        );
        // The camera is usable again
        start_preview_with_display(&camera);
    }

    #[test]
    fn test_cancel_auto_focus_when_idle() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::FOCUS);

        camera.cancel_auto_focus().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(recorder.notifications.lock().is_empty());
        assert!(!backend
            .node_state(PRIMARY)
            .controls
            .contains_key(&ControlId::AutoFocusStart));
    }

    #[test]
    fn test_auto_focus_reports_result() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::FOCUS);

        camera.auto_focus().unwrap();
        assert!(wait_until(|| !recorder.notifications.lock().is_empty()));
        assert_eq!(
            recorder.notifications.lock().as_slice(),
            &[Notification::Focus(true)]
        );
        assert_eq!(
            backend.node_state(PRIMARY).controls.get(&ControlId::AutoFocusStart),
            Some(&1)
        );
    }

    #[test]
    fn test_auto_focus_failure_and_fixed_focus() {
        let backend = SimBackend::with_config(
            SimConfig {
                autofocus_result: 3,
                ..SimConfig::default()
            },
            SimEncoderConfig::default(),
        );
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::FOCUS);

        camera.auto_focus().unwrap();
        assert!(wait_until(|| recorder.notifications.lock().len() == 1));
        assert_eq!(recorder.notifications.lock()[0], Notification::Focus(false));

        let mut map = ParameterMap::new();
        map.set("focus-mode", "infinity");
        camera.set_parameters(&map).unwrap();
        camera.auto_focus().unwrap();
        assert!(wait_until(|| recorder.notifications.lock().len() == 2));
        assert_eq!(recorder.notifications.lock()[1], Notification::Focus(true));
    }

    #[test]
    fn test_set_parameters_applies_valid_fields() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());

        let mut map = ParameterMap::new();
        map.set("zoom", 13);
        map.set("exposure-compensation", 2);
        let err = camera.set_parameters(&map).unwrap_err();
        assert!(matches!(err, CameraError::InvalidArgument(ref m) if m.contains("zoom")));

        let params = camera.get_parameters();
        assert_eq!(params.get("zoom"), Some("0"));
        assert_eq!(params.get("exposure-compensation"), Some("2"));

        // Staged settings reach the device with the next preview start
        start_preview_with_display(&camera);
        assert_eq!(
            backend.node_state(PRIMARY).controls.get(&ControlId::Exposure),
            Some(&2)
        );
    }

    #[test]
    fn test_preview_size_change_restarts_preview() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        start_preview_with_display(&camera);

        let mut map = ParameterMap::new();
        map.set("preview-size", "320x240");
        camera.set_parameters(&map).unwrap();

        assert!(camera.status().previewing);
        let node = backend.node_state(PRIMARY);
        assert_eq!(node.format, Some((Resolution::QVGA, PixelFormat::Yuv420)));
        assert_eq!(node.stream_ons, 2);
    }

    /// Reads camera state from inside the preview callback
    #[derive(Default)]
    struct StateReader {
        camera: OnceLock<std::sync::Weak<CaptureOrchestrator>>,
        reads: AtomicUsize,
    }

    impl CameraCallbacks for StateReader {
        fn on_preview_frame(&self, _frame: MemorySlot) {
            let Some(camera) = self.camera.get().and_then(|c| c.upgrade()) else {
                return;
            };
            let _ = camera.status();
            let _ = camera.parameters();
            let _ = camera.get_parameters();
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_set_parameters_while_callback_reads_state() {
        let backend = SimBackend::new();
        let camera = Arc::new(open_with(&backend, test_config()));
        let reader = Arc::new(StateReader::default());
        let _ = reader.camera.set(Arc::downgrade(&camera));
        camera.set_callbacks(reader.clone());
        camera.enable_msg_type(msg::PREVIEW_FRAME);

        start_preview_with_display(&camera);
        assert!(wait_until(|| reader.reads.load(Ordering::SeqCst) >= 1));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let client = camera.clone();
        thread::spawn(move || {
            for i in 0..50 {
                let mut map = ParameterMap::new();
                map.set("preview-size", if i % 2 == 0 { "320x240" } else { "640x480" });
                client.set_parameters(&map).unwrap();
            }
            client
                .set_preview_window(Some(Box::new(MemoryDisplay::new(2))))
                .unwrap();
            drop(client);
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(Duration::from_secs(10)).is_ok(),
            "preview restarts blocked against a callback reading state"
        );

        assert_eq!(backend.node_state(PRIMARY).stream_ons, 51);
        assert!(reader.reads.load(Ordering::SeqCst) > 1);
        assert!(!camera.preview_enabled());
        camera.set_callbacks(Arc::new(NoCallbacks));
    }

    fn skip_config(initial: u32, effect: u32) -> CameraConfig {
        CameraConfig {
            initial_skip_frames: initial,
            effect_skip_frames: effect,
            ..test_config()
        }
    }

    /// Frames dequeued from the primary node but never handed to the client.
    /// Only stable once preview is stopped.
    fn skipped_frames(backend: &SimBackend, recorder: &Recorder) -> u64 {
        let delivered = recorder.preview_frames.load(Ordering::SeqCst) as u64;
        backend.node_state(PRIMARY).dequeues - delivered
    }

    #[test]
    fn test_initial_frames_are_skipped() {
        for (skip, first_index) in [(3, 3), (0, 0)] {
            let backend = SimBackend::new();
            let camera = open_with(&backend, skip_config(skip, 1));
            let recorder = Arc::new(Recorder::default());
            camera.set_callbacks(recorder.clone());
            camera.enable_msg_type(msg::PREVIEW_FRAME);

            start_preview_with_display(&camera);
            assert!(wait_until(|| recorder.preview_frames.load(Ordering::SeqCst) >= 5));
            camera.stop_preview();

            // Buffers cycle in queue order, so dequeue n + 1 is buffer n
            let (index, _) = recorder.first_preview.lock().clone().unwrap();
            assert_eq!(index, first_index);
            assert_eq!(skipped_frames(&backend, &recorder), skip as u64);
        }
    }

    #[test]
    fn test_effect_change_skips_frames() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, skip_config(3, 2));
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::PREVIEW_FRAME);
        let delivered = |n: usize| wait_until(|| recorder.preview_frames.load(Ordering::SeqCst) >= n);

        start_preview_with_display(&camera);
        assert!(delivered(3));

        let mut map = ParameterMap::new();
        map.set("effect", "none");
        camera.set_parameters(&map).unwrap();
        assert!(delivered(6));

        map.set("effect", "mono");
        camera.set_parameters(&map).unwrap();
        assert!(delivered(9));

        camera.stop_preview();
        // Three at start, two for mono, none for the unchanged effect
        assert_eq!(skipped_frames(&backend, &recorder), 5);
    }

    #[test]
    fn test_preview_recovery_clears_failure_throttle() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let throttler = &camera.inner.throttler;

        camera.inner.on_preview_error(CameraError::CaptureTimeout {
            context: "stalled".to_string(),
            timeout: Duration::from_millis(1),
        });
        camera
            .inner
            .on_preview_error(CameraError::DeviceError("gone".to_string()));
        assert_eq!(throttler.len(), 1);
        assert!(!throttler.should_log(PREVIEW_LOG_KEY));

        let presented = start_preview_with_display(&camera);
        assert!(wait_until(|| presented.load(Ordering::Relaxed) >= 2));
        assert!(throttler.should_log(PREVIEW_LOG_KEY));
    }

    #[test]
    fn test_late_record_release_is_throttled() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        start_preview_with_display(&camera);
        camera.start_recording().unwrap();
        camera.stop_recording().unwrap();

        for index in 0..4 {
            camera.release_recording_frame(index).unwrap();
        }
        assert!(!camera.inner.throttler.should_log(LATE_RELEASE_LOG_KEY));

        camera.start_recording().unwrap();
        assert!(camera.inner.throttler.should_log(LATE_RELEASE_LOG_KEY));
    }

    #[test]
    fn test_zoom_applied_while_previewing() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        start_preview_with_display(&camera);

        let mut map = ParameterMap::new();
        map.set("zoom", 12);
        camera.set_parameters(&map).unwrap();
        assert!(wait_until(|| !backend.node_state(PRIMARY).crops.is_empty()));
        assert_eq!(
            backend.node_state(PRIMARY).crops.last(),
            Some(&crate::video::device::Rect::new(960, 720, 640, 480))
        );
    }

    #[test]
    fn test_recording_delivers_record_frames() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        let recorder = Arc::new(Recorder::default());
        camera.set_callbacks(recorder.clone());
        camera.enable_msg_type(msg::VIDEO_FRAME);

        start_preview_with_display(&camera);
        camera.start_recording().unwrap();
        camera.start_recording().unwrap();
        assert_eq!(camera.state(), CaptureState::Recording);
        assert!(wait_until(|| recorder.record_frames.lock().len() >= 2));

        let frames = recorder.record_frames.lock().clone();
        for (_, addrs) in &frames {
            assert_eq!(addrs.kind, 0);
            assert_eq!(addrs.addr_y, SimBackend::phys_addr(addrs.buf_index as usize).0);
            assert_eq!(addrs.addr_cbcr, addrs.addr_y + Resolution::VGA.pixels() as u32);
            camera
                .release_recording_frame(addrs.buf_index as usize)
                .unwrap();
        }
        assert!(frames.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(
            backend.node_state(RECORD).format,
            Some((Resolution::VGA, PixelFormat::Nv12t))
        );

        camera.stop_recording().unwrap();
        camera.stop_recording().unwrap();
        assert!(!camera.recording_enabled());
        assert_eq!(camera.state(), CaptureState::Previewing);
    }

    #[test]
    fn test_recording_needs_record_device() {
        let backend = SimBackend::new();
        let config = CameraConfig {
            record_device: None,
            ..test_config()
        };
        let camera = open_with(&backend, config);
        assert!(matches!(
            camera.start_recording(),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_face_detection_follows_preview() {
        let backend = SimBackend::new();
        let camera = open_with(&backend, test_config());
        assert!(matches!(
            camera.send_command(Command::StartFaceDetection),
            Err(CameraError::InvalidOperation(_))
        ));

        start_preview_with_display(&camera);
        camera.send_command(Command::StartFaceDetection).unwrap();
        camera.send_command(Command::StartFaceDetection).unwrap();
        assert!(camera.status().face_detection);
        assert_eq!(
            backend.node_state(PRIMARY).controls.get(&ControlId::FaceDetection),
            Some(&1)
        );

        camera.stop_preview();
        assert!(!camera.status().face_detection);
        assert_eq!(
            backend.node_state(PRIMARY).controls.get(&ControlId::FaceDetection),
            Some(&0)
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let backend = SimBackend::new();
        let mut camera = open_with(&backend, test_config());
        start_preview_with_display(&camera);
        camera.start_recording().unwrap();

        camera.release();
        camera.release();
        assert_eq!(backend.mapped_buffers(), 0);
        assert!(matches!(
            camera.auto_focus(),
            Err(CameraError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_open_fails_without_capture_device() {
        let backend = SimBackend::with_config(
            SimConfig {
                capture_capable: false,
                ..SimConfig::default()
            },
            SimEncoderConfig::default(),
        );
        let result = CaptureOrchestrator::open(Arc::new(backend), test_config());
        assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
    }
}
