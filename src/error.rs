use std::time::Duration;

use thiserror::Error;

/// Camera pipeline error type
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Capture timeout after {timeout:?}: {context}")]
    CaptureTimeout { context: String, timeout: Duration },

    #[error("Resource error: {0}")]
    ResourceError(String),

    #[error("Encoder configuration error: {0}")]
    EncodeConfigError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CameraError {
    /// Short machine-readable kind, used as the log throttling key
    pub fn kind(&self) -> &'static str {
        match self {
            CameraError::DeviceUnavailable(_) => "device_unavailable",
            CameraError::UnsupportedFormat(_) => "unsupported_format",
            CameraError::InvalidArgument(_) => "invalid_argument",
            CameraError::InvalidOperation(_) => "invalid_operation",
            CameraError::DeviceError(_) => "device_error",
            CameraError::CaptureTimeout { .. } => "capture_timeout",
            CameraError::ResourceError(_) => "resource_error",
            CameraError::EncodeConfigError(_) => "encode_config_error",
            CameraError::EncodeError(_) => "encode_error",
            CameraError::Busy(_) => "busy",
            CameraError::Config(_) => "config",
            CameraError::Io(_) => "io",
            CameraError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for the camera pipeline
pub type Result<T> = std::result::Result<T, CameraError>;
