//! Scoped still-encoder session
//!
//! [`EncodeBridge`] brackets one encoder device session: it is opened from a
//! backend, configured once, fed one frame per [`EncodeBridge::encode`], and
//! closes the device when dropped, whether or not the encode succeeded.

use tracing::debug;

use super::traits::{EncodeConfig, EncodeInput, EncoderDevice, ExifInfo};
use crate::error::{CameraError, Result};
use crate::video::device::DeviceBackend;

/// Encoded bitstream, borrowed from the bridge until the next encode
#[derive(Debug, Clone, Copy)]
pub struct EncodedImage<'a> {
    pub data: &'a [u8],
    pub thumbnail: Option<&'a [u8]>,
}

impl EncodedImage<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One open encoder session
pub struct EncodeBridge {
    device: Box<dyn EncoderDevice>,
    config: Option<EncodeConfig>,
    closed: bool,
}

impl EncodeBridge {
    /// Open an encoder session on `backend`
    pub fn open(backend: &dyn DeviceBackend) -> Result<Self> {
        let device = backend.open_encoder()?;
        debug!("Opened encoder session on {}", device.name());
        Ok(Self::with_device(device))
    }

    /// Wrap an already opened device
    pub fn with_device(device: Box<dyn EncoderDevice>) -> Self {
        Self {
            device,
            config: None,
            closed: false,
        }
    }

    pub fn config(&self) -> Option<&EncodeConfig> {
        self.config.as_ref()
    }

    /// Push every scalar setting to the device.
    ///
    /// Any single rejected setting fails the whole configuration and leaves
    /// the bridge unconfigured.
    pub fn configure(&mut self, config: &EncodeConfig) -> Result<()> {
        if self.closed {
            return Err(CameraError::InvalidOperation(
                "Encoder session is closed".to_string(),
            ));
        }
        self.config = None;

        for param in config.params()? {
            self.device.set_param(param).map_err(|e| match e {
                CameraError::EncodeConfigError(msg) => CameraError::EncodeConfigError(msg),
                other => CameraError::EncodeConfigError(format!("{:?}: {}", param, other)),
            })?;
        }

        debug!(
            "Encoder configured: {} {} q={} thumbnail={:?}",
            config.resolution,
            config.input_format,
            config.quality,
            config.thumbnail.map(|t| t.resolution)
        );
        self.config = Some(config.clone());
        Ok(())
    }

    /// Whether frames can be handed over by physical address
    pub fn supports_physical_input(&self) -> bool {
        self.device.supports_physical_input()
    }

    /// Submit one frame and return the encoded bitstream.
    ///
    /// The returned image borrows the bridge and is invalidated by the next
    /// encode or by closing the session.
    pub fn encode(&mut self, input: EncodeInput<'_>, exif: &ExifInfo) -> Result<EncodedImage<'_>> {
        if self.closed {
            return Err(CameraError::InvalidOperation(
                "Encoder session is closed".to_string(),
            ));
        }
        let config = self.config.as_ref().ok_or_else(|| {
            CameraError::InvalidOperation("Encoder used before configure".to_string())
        })?;

        match input {
            EncodeInput::Frame(data) => {
                let expected = config
                    .input_format
                    .frame_size(config.resolution)
                    .unwrap_or(data.len());
                if data.len() < expected {
                    return Err(CameraError::EncodeError(format!(
                        "Input frame too small: {} < {}",
                        data.len(),
                        expected
                    )));
                }
                let buffer = self
                    .device
                    .input_buffer(data.len())
                    .map_err(|e| CameraError::EncodeError(e.to_string()))?;
                if buffer.len() < data.len() {
                    return Err(CameraError::EncodeError(format!(
                        "Encoder input buffer too small: {} < {}",
                        buffer.len(),
                        data.len()
                    )));
                }
                buffer[..data.len()].copy_from_slice(data);
            }
            EncodeInput::Physical { y, cbcr } => {
                if !y.is_valid() || !cbcr.is_valid() {
                    return Err(CameraError::EncodeError(format!(
                        "Invalid physical input address {} / {}",
                        y, cbcr
                    )));
                }
                if !self.device.supports_physical_input() {
                    return Err(CameraError::EncodeError(format!(
                        "{} does not accept physical input",
                        self.device.name()
                    )));
                }
                self.device
                    .set_input_physical(y, cbcr)
                    .map_err(|e| CameraError::EncodeError(e.to_string()))?;
            }
        }

        self.device.encode(exif).map_err(|e| match e {
            CameraError::EncodeError(msg) => CameraError::EncodeError(msg),
            other => CameraError::EncodeError(other.to_string()),
        })?;

        let data = self.device.output()?;
        if data.is_empty() {
            return Err(CameraError::EncodeError(
                "Encoder produced an empty bitstream".to_string(),
            ));
        }
        Ok(EncodedImage {
            data,
            thumbnail: self.device.thumbnail_output(),
        })
    }

    /// Close the device session. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.device.close();
            self.closed = true;
            self.config = None;
            debug!("Closed encoder session");
        }
    }
}

impl Drop for EncodeBridge {
    fn drop(&mut self) {
        self.close();
    }
}
