//! Camera control
//!
//! - [`profile`]: per-sensor constants
//! - [`settings`]: typed settings and the ledger of what the device holds
//! - [`params`]: the flat key/value parameter surface
//! - [`sinks`]: display, callback and shared memory seams
//! - [`orchestrator`]: preview, record, still and focus workers
//! - [`registry`]: open-camera bookkeeping

mod hardware;
pub mod orchestrator;
pub mod params;
pub mod profile;
pub mod registry;
pub mod settings;
pub mod sinks;

pub use orchestrator::{CaptureOrchestrator, CaptureState, CaptureStatus, Command};
pub use params::{CameraParameters, ParameterMap, PictureFormat, PreviewFormat};
pub use profile::{DeviceProfile, Facing};
pub use registry::{CameraHandle, CameraRegistry, MAX_OPEN_CAMERAS};
pub use settings::{Setting, SettingId, SettingsLedger};
pub use sinks::{
    msg, CameraCallbacks, DisplaySink, ErrorCode, HeapAllocator, MemoryAllocator, MemoryDisplay,
    MemorySlot, NoCallbacks, Notification, RecordAddrs, SharedMemory,
};
