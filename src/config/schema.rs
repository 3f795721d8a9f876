use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::camera::profile::Facing;
use crate::error::{CameraError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture pipeline settings
    pub camera: CameraConfig,
    /// Logging defaults, overridden by the command line and RUST_LOG
    pub log: LogConfig,
}

impl AppConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.camera.validate()
    }
}

/// Camera pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Primary capture node (e.g., /dev/video0)
    pub device: String,
    /// Record capture node; recording is unavailable when unset
    pub record_device: Option<String>,
    /// Sensor to open; selects the device profile
    pub facing: Facing,
    /// Capture buffers requested per stream
    pub buffer_count: u32,
    /// First-frame and dequeue timeout in milliseconds
    pub frame_timeout_ms: u64,
    /// Frames dropped after preview starts
    pub initial_skip_frames: u32,
    /// Frames dropped after an effect change
    pub effect_skip_frames: u32,
    /// Upper bound on one auto-focus run in milliseconds
    pub autofocus_timeout_ms: u64,
    /// Auto-focus status poll interval in milliseconds
    pub autofocus_poll_ms: u64,
    /// Hand the encoder physical buffer addresses when it accepts them
    pub zero_copy: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            record_device: Some("/dev/video2".to_string()),
            facing: Facing::Back,
            buffer_count: 4,
            frame_timeout_ms: 5000,
            initial_skip_frames: 3,
            effect_skip_frames: 1,
            autofocus_timeout_ms: 2000,
            autofocus_poll_ms: 100,
            zero_copy: true,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(CameraError::Config("camera.device is empty".to_string()));
        }
        if self.buffer_count == 0 {
            return Err(CameraError::Config(
                "camera.buffer_count must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("frame_timeout_ms", self.frame_timeout_ms),
            ("autofocus_timeout_ms", self.autofocus_timeout_ms),
            ("autofocus_poll_ms", self.autofocus_poll_ms),
        ] {
            if value == 0 {
                return Err(CameraError::Config(format!("camera.{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn autofocus_timeout(&self) -> Duration {
        Duration::from_millis(self.autofocus_timeout_ms)
    }

    pub fn autofocus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.autofocus_poll_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when neither RUST_LOG nor -v is given
    pub level: String,
    /// Emit JSON lines instead of the compact format
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
