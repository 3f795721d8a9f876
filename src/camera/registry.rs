//! Open-camera bookkeeping
//!
//! Each device node can back one open camera at a time and only a small
//! number of cameras may be open together.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info};

use super::orchestrator::CaptureOrchestrator;
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::video::device::DeviceBackend;

/// Cameras that may be open at once
pub const MAX_OPEN_CAMERAS: usize = 2;

/// Factory for [`CaptureOrchestrator`]s keyed by primary device node
pub struct CameraRegistry {
    backend: Arc<dyn DeviceBackend>,
    open: Arc<Mutex<HashSet<String>>>,
}

impl CameraRegistry {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open the camera described by `config`.
    ///
    /// Fails with `Busy` when its node is already open and with
    /// `ResourceError` when the open limit is reached.
    pub fn open(&self, config: CameraConfig) -> Result<CameraHandle> {
        let mut open = self.open.lock();
        if open.contains(&config.device) {
            return Err(CameraError::Busy(format!(
                "Camera {} is already open",
                config.device
            )));
        }
        if open.len() >= MAX_OPEN_CAMERAS {
            return Err(CameraError::ResourceError(format!(
                "Maximum open cameras ({}) reached",
                MAX_OPEN_CAMERAS
            )));
        }

        let node = config.device.clone();
        let camera = CaptureOrchestrator::open(self.backend.clone(), config)?;
        open.insert(node.clone());
        info!("Camera {} registered ({} open)", node, open.len());

        Ok(CameraHandle {
            camera,
            node,
            open: self.open.clone(),
        })
    }

    /// Device nodes currently open
    pub fn open_devices(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.open.lock().iter().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn is_open(&self, node: &str) -> bool {
        self.open.lock().contains(node)
    }
}

/// An open camera. Dropping the handle releases the device and frees its
/// registry slot.
pub struct CameraHandle {
    camera: CaptureOrchestrator,
    node: String,
    open: Arc<Mutex<HashSet<String>>>,
}

impl CameraHandle {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Deref for CameraHandle {
    type Target = CaptureOrchestrator;

    fn deref(&self) -> &Self::Target {
        &self.camera
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.camera.release();
        self.open.lock().remove(&self.node);
        debug!("Camera {} unregistered", self.node);
    }
}
