//! Memory-mapped capture buffer pool
//!
//! A [`BufferPool`] owns the mappings of one streaming session and tracks,
//! per buffer, whether the driver or the application currently holds it.

use tracing::{debug, warn};

use super::device::MappedRegion;
use crate::error::{CameraError, Result};

/// Current holder of a capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Queued to the driver, may be filled at any time
    Driver,
    /// Dequeued; readable until handed back to the driver
    Application,
}

/// One mapped capture buffer
pub struct CaptureBuffer {
    index: usize,
    region: Box<dyn MappedRegion>,
    owner: BufferOwner,
    bytes_used: usize,
}

impl CaptureBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn owner(&self) -> BufferOwner {
        self.owner
    }

    /// Bytes filled by the driver at the last dequeue
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Whole mapping
    pub fn data(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// Filled part of the mapping
    pub fn payload(&self) -> &[u8] {
        let data = self.region.as_slice();
        &data[..self.bytes_used.min(data.len())]
    }
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("index", &self.index)
            .field("len", &self.len())
            .field("owner", &self.owner)
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}

/// Ring of mapped buffers for one session
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<CaptureBuffer>,
    size_per_buffer: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `count` regions through `map`, all initially owned by the driver.
    ///
    /// On the first failure every region mapped so far is unmapped and
    /// `ResourceError` is returned; the pool stays empty.
    pub fn allocate<F>(&mut self, count: usize, size_per_buffer: usize, mut map: F) -> Result<()>
    where
        F: FnMut(usize) -> Result<Box<dyn MappedRegion>>,
    {
        if !self.buffers.is_empty() {
            return Err(CameraError::InvalidOperation(
                "Buffer pool already allocated".to_string(),
            ));
        }
        if count == 0 {
            return Err(CameraError::ResourceError(
                "Cannot allocate an empty buffer pool".to_string(),
            ));
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let region = match map(index) {
                Ok(region) => region,
                Err(e) => {
                    warn!(
                        "Mapping buffer {} failed, unmapping {} buffers: {}",
                        index,
                        buffers.len(),
                        e
                    );
                    drop(buffers);
                    return Err(CameraError::ResourceError(format!(
                        "Failed to map buffer {}: {}",
                        index, e
                    )));
                }
            };
            if region.len() < size_per_buffer {
                warn!(
                    "Buffer {} is {} bytes, expected at least {}",
                    index,
                    region.len(),
                    size_per_buffer
                );
            }
            buffers.push(CaptureBuffer {
                index,
                region,
                owner: BufferOwner::Driver,
                bytes_used: 0,
            });
        }

        debug!("Mapped {} capture buffers", count);
        self.buffers = buffers;
        self.size_per_buffer = size_per_buffer;
        Ok(())
    }

    /// Unmap every region. Safe to call when already released.
    pub fn release(&mut self) {
        if !self.buffers.is_empty() {
            debug!("Unmapping {} capture buffers", self.buffers.len());
        }
        self.buffers.clear();
        self.size_per_buffer = 0;
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Size requested per buffer at allocation time
    pub fn size_per_buffer(&self) -> usize {
        self.size_per_buffer
    }

    /// Bounds-checked access.
    ///
    /// # Panics
    ///
    /// Panics when `index` is outside the pool; callers only hold indices
    /// returned by the driver for this pool.
    pub fn buffer_at(&self, index: usize) -> &CaptureBuffer {
        match self.buffers.get(index) {
            Some(buffer) => buffer,
            None => panic!(
                "buffer index {} out of range for pool of {}",
                index,
                self.buffers.len()
            ),
        }
    }

    /// Non-panicking access
    pub fn get(&self, index: usize) -> Option<&CaptureBuffer> {
        self.buffers.get(index)
    }

    /// Record that the driver returned buffer `index` to the application
    pub(crate) fn mark_dequeued(&mut self, index: usize, bytes_used: usize) -> Result<()> {
        let buffer = self.buffers.get_mut(index).ok_or_else(|| {
            CameraError::DeviceError(format!("Driver returned unknown buffer index {}", index))
        })?;
        if buffer.owner == BufferOwner::Application {
            return Err(CameraError::DeviceError(format!(
                "Buffer {} dequeued twice without being requeued",
                index
            )));
        }
        buffer.owner = BufferOwner::Application;
        buffer.bytes_used = bytes_used;
        Ok(())
    }

    /// Check that buffer `index` may be handed back to the driver
    pub(crate) fn check_requeue(&self, index: usize) -> Result<()> {
        match self.buffers.get(index) {
            Some(buffer) if buffer.owner == BufferOwner::Application => Ok(()),
            Some(_) => Err(CameraError::InvalidArgument(format!(
                "Buffer {} is already owned by the driver",
                index
            ))),
            None => Err(CameraError::InvalidArgument(format!(
                "Buffer index {} out of range for pool of {}",
                index,
                self.buffers.len()
            ))),
        }
    }

    /// Record that buffer `index` is queued to the driver
    pub(crate) fn mark_queued(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.owner = BufferOwner::Driver;
            buffer.bytes_used = 0;
        }
    }

    /// Number of buffers currently held by the application
    pub fn application_owned(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.owner == BufferOwner::Application)
            .count()
    }
}
