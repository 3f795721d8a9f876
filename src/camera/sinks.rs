//! Host-side collaborators the orchestrator pushes frames into
//!
//! - [`DisplaySink`]: presentation buffers for the preview window
//! - [`CameraCallbacks`]: client notifications and data callbacks
//! - [`MemoryAllocator`]: shared output memory handed to the client

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{CameraError, Result};
use crate::video::convert::yv12_buffer_size;
use crate::video::device::PhysAddr;
use crate::video::format::Resolution;
use crate::video::frame::CapturedFrame;

/// Message types a client can enable
pub mod msg {
    pub const ERROR: u32 = 0x0001;
    pub const SHUTTER: u32 = 0x0002;
    pub const FOCUS: u32 = 0x0004;
    pub const PREVIEW_FRAME: u32 = 0x0010;
    pub const VIDEO_FRAME: u32 = 0x0020;
    pub const RAW_IMAGE: u32 = 0x0080;
    pub const COMPRESSED_IMAGE: u32 = 0x0100;
    pub const ALL: u32 = ERROR | SHUTTER | FOCUS | PREVIEW_FRAME | VIDEO_FRAME | RAW_IMAGE
        | COMPRESSED_IMAGE;
}

/// Asynchronous notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Shutter,
    /// Auto-focus finished; `true` when focus was reached
    Focus(bool),
    Error(ErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    ServerDied,
}

/// Preview window.
///
/// Buffers go through dequeue, lock, write, unlock and enqueue. A buffer
/// that could not be written is handed back with `cancel_buffer`.
pub trait DisplaySink: Send {
    /// Called when preview starts, before the first dequeue. Buffers are
    /// YV12 with the layout of [`crate::video::convert::yv12_strides`].
    fn set_geometry(&mut self, resolution: Resolution) -> Result<()>;

    fn dequeue_buffer(&mut self) -> Result<usize>;

    /// Writable view of a dequeued buffer
    fn lock_buffer(&mut self, slot: usize) -> Result<&mut [u8]>;

    fn unlock_buffer(&mut self, slot: usize) -> Result<()>;

    fn enqueue_buffer(&mut self, slot: usize) -> Result<()>;

    fn cancel_buffer(&mut self, slot: usize) -> Result<()>;
}

/// Client callbacks.
///
/// Called from worker threads with no orchestrator lock held, so a
/// callback may call back into the orchestrator.
pub trait CameraCallbacks: Send + Sync {
    fn notify(&self, _event: Notification) {}

    /// A preview frame was written to `frame`
    fn on_preview_frame(&self, _frame: MemorySlot) {}

    /// Uncompressed snapshot
    fn on_raw_image(&self, _frame: &CapturedFrame) {}

    fn on_compressed_image(&self, _data: Bytes) {}

    /// A record frame described by a [`RecordAddrs`] in `frame`. The
    /// buffer stays out of the driver queue until
    /// `release_recording_frame` is called with its index.
    fn on_record_frame(&self, _timestamp: Duration, _frame: MemorySlot) {}
}

/// Callbacks that drop everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl CameraCallbacks for NoCallbacks {}

/// Fixed-size slotted memory shared with the client
#[derive(Debug, Clone)]
pub struct SharedMemory {
    slot_size: usize,
    slots: usize,
    data: Arc<RwLock<Vec<u8>>>,
}

impl SharedMemory {
    pub fn new(slot_size: usize, slots: usize) -> Self {
        Self {
            slot_size,
            slots,
            data: Arc::new(RwLock::new(vec![0; slot_size * slots])),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn range(&self, slot: usize) -> Result<std::ops::Range<usize>> {
        if slot >= self.slots {
            return Err(CameraError::InvalidArgument(format!(
                "Memory slot {} out of range ({} slots)",
                slot, self.slots
            )));
        }
        let start = slot * self.slot_size;
        Ok(start..start + self.slot_size)
    }

    /// Run `f` on the bytes of `slot`
    pub fn with_slot_mut<R>(&self, slot: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let range = self.range(slot)?;
        let mut data = self.data.write();
        Ok(f(&mut data[range]))
    }

    /// Copy `src` to the start of `slot`
    pub fn write_slot(&self, slot: usize, src: &[u8]) -> Result<()> {
        if src.len() > self.slot_size {
            return Err(CameraError::InvalidArgument(format!(
                "{} bytes do not fit a {} byte slot",
                src.len(),
                self.slot_size
            )));
        }
        self.with_slot_mut(slot, |dst| dst[..src.len()].copy_from_slice(src))
    }

    /// Copy of the bytes of `slot`
    pub fn read_slot(&self, slot: usize) -> Result<Bytes> {
        let range = self.range(slot)?;
        Ok(Bytes::copy_from_slice(&self.data.read()[range]))
    }
}

/// One slot of a [`SharedMemory`]
#[derive(Debug, Clone)]
pub struct MemorySlot {
    pub memory: SharedMemory,
    pub index: usize,
}

impl MemorySlot {
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.memory.read_slot(self.index)
    }

    /// The slot read as a record frame descriptor
    pub fn record_addrs(&self) -> Result<RecordAddrs> {
        let bytes = self.to_bytes()?;
        let size = std::mem::size_of::<RecordAddrs>();
        if bytes.len() < size {
            return Err(CameraError::InvalidArgument(format!(
                "Slot of {} bytes holds no record descriptor",
                bytes.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
    }
}

/// Source of shared output memory
pub trait MemoryAllocator: Send + Sync {
    fn allocate(&self, slot_size: usize, slots: usize) -> Result<SharedMemory>;
}

/// Plain process heap
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl MemoryAllocator for HeapAllocator {
    fn allocate(&self, slot_size: usize, slots: usize) -> Result<SharedMemory> {
        if slot_size == 0 || slots == 0 {
            return Err(CameraError::ResourceError(format!(
                "Cannot allocate {} slots of {} bytes",
                slots, slot_size
            )));
        }
        trace!("Allocating {} x {} bytes of shared memory", slots, slot_size);
        Ok(SharedMemory::new(slot_size, slots))
    }
}

/// Descriptor type of record frames: the payload lives in the capture buffer
pub const RECORD_SOURCE_CAMERA: u32 = 0;

/// Record frame descriptor handed to the video consumer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RecordAddrs {
    pub kind: u32,
    pub addr_y: u32,
    pub addr_cbcr: u32,
    pub buf_index: u32,
}

impl RecordAddrs {
    pub fn new(y: PhysAddr, cbcr: PhysAddr, index: usize) -> Self {
        Self {
            kind: RECORD_SOURCE_CAMERA,
            addr_y: y.0,
            addr_cbcr: cbcr.0,
            buf_index: index as u32,
        }
    }
}

/// Display sink backed by process memory.
///
/// Presentation is immediate: an enqueued buffer is free again at once.
pub struct MemoryDisplay {
    buffers: Vec<Vec<u8>>,
    free: VecDeque<usize>,
    locked: Option<usize>,
    resolution: Option<Resolution>,
    presented: Arc<AtomicU64>,
}

impl MemoryDisplay {
    pub fn new(slots: usize) -> Self {
        Self {
            buffers: vec![Vec::new(); slots],
            free: (0..slots).collect(),
            locked: None,
            resolution: None,
            presented: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of presented frames, readable after the sink is handed off
    pub fn presented(&self) -> Arc<AtomicU64> {
        self.presented.clone()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.buffers.len() || self.free.contains(&slot) {
            return Err(CameraError::InvalidArgument(format!(
                "Display buffer {} is not dequeued",
                slot
            )));
        }
        Ok(())
    }
}

impl DisplaySink for MemoryDisplay {
    fn set_geometry(&mut self, resolution: Resolution) -> Result<()> {
        let size = yv12_buffer_size(resolution);
        for buffer in &mut self.buffers {
            buffer.resize(size, 0);
        }
        self.resolution = Some(resolution);
        debug!("Display geometry {} ({} byte buffers)", resolution, size);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<usize> {
        if self.resolution.is_none() {
            return Err(CameraError::InvalidOperation(
                "Display geometry not set".to_string(),
            ));
        }
        self.free.pop_front().ok_or_else(|| {
            CameraError::ResourceError("No free display buffer".to_string())
        })
    }

    fn lock_buffer(&mut self, slot: usize) -> Result<&mut [u8]> {
        self.check_slot(slot)?;
        self.locked = Some(slot);
        Ok(&mut self.buffers[slot])
    }

    fn unlock_buffer(&mut self, slot: usize) -> Result<()> {
        if self.locked != Some(slot) {
            return Err(CameraError::InvalidOperation(format!(
                "Display buffer {} is not locked",
                slot
            )));
        }
        self.locked = None;
        Ok(())
    }

    fn enqueue_buffer(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.free.push_back(slot);
        self.presented.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cancel_buffer(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        if self.locked == Some(slot) {
            self.locked = None;
        }
        self.free.push_back(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_memory_slots() {
        let memory = HeapAllocator.allocate(4, 3).unwrap();
        memory.write_slot(1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read_slot(1).unwrap().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(memory.read_slot(0).unwrap().as_ref(), &[0, 0, 0, 0]);
        assert!(memory.write_slot(3, &[0]).is_err());
        assert!(memory.write_slot(0, &[0; 5]).is_err());
        assert!(HeapAllocator.allocate(0, 3).is_err());
    }

    #[test]
    fn test_record_addrs_layout() {
        assert_eq!(std::mem::size_of::<RecordAddrs>(), 16);

        let memory = SharedMemory::new(std::mem::size_of::<RecordAddrs>(), 4);
        let addrs = RecordAddrs::new(PhysAddr(0x4000_0000), PhysAddr(0x4004_b000), 2);
        memory.write_slot(2, bytemuck::bytes_of(&addrs)).unwrap();

        let slot = MemorySlot { memory, index: 2 };
        let read = slot.record_addrs().unwrap();
        assert_eq!(read, addrs);
        assert_eq!(read.kind, RECORD_SOURCE_CAMERA);
        assert_eq!(read.buf_index, 2);
    }

    #[test]
    fn test_memory_display_cycle() {
        let mut display = MemoryDisplay::new(2);
        let presented = display.presented();
        assert!(display.dequeue_buffer().is_err());

        display.set_geometry(Resolution::QVGA).unwrap();
        let slot = display.dequeue_buffer().unwrap();
        assert_eq!(
            display.lock_buffer(slot).unwrap().len(),
            yv12_buffer_size(Resolution::QVGA)
        );
        display.unlock_buffer(slot).unwrap();
        display.enqueue_buffer(slot).unwrap();
        assert_eq!(presented.load(Ordering::Relaxed), 1);

        // Re-enqueueing a free buffer is a caller error
        assert!(display.enqueue_buffer(slot).is_err());

        let a = display.dequeue_buffer().unwrap();
        let b = display.dequeue_buffer().unwrap();
        assert!(display.dequeue_buffer().is_err());
        display.cancel_buffer(a).unwrap();
        display.cancel_buffer(b).unwrap();
        assert_eq!(presented.load(Ordering::Relaxed), 1);
    }
}
