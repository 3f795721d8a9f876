//! Encoder device trait and common types

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CameraError, Result};
use crate::video::device::PhysAddr;
use crate::video::format::{PixelFormat, Resolution};

/// Chroma sampling of the encoder input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    Yuv444,
    Yuv422,
    Yuv420,
    Gray,
    Yuv411,
}

impl SamplingMode {
    /// Sampling mode for a captured pixel format.
    /// RGB and compressed inputs cannot be fed to the encoder.
    pub fn for_format(format: PixelFormat) -> Result<Self> {
        match format {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Nv12t | PixelFormat::Yuv420 => {
                Ok(SamplingMode::Yuv420)
            }
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Yuv422p => {
                Ok(SamplingMode::Yuv422)
            }
            other => Err(CameraError::EncodeConfigError(format!(
                "Pixel format {} cannot be encoded",
                other
            ))),
        }
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplingMode::Yuv444 => "4:4:4",
            SamplingMode::Yuv422 => "4:2:2",
            SamplingMode::Yuv420 => "4:2:0",
            SamplingMode::Gray => "4:0:0",
            SamplingMode::Yuv411 => "4:1:1",
        };
        write!(f, "{}", name)
    }
}

/// Encoder input colour space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputColorSpace {
    YCbCr,
    Rgb,
}

/// One scalar encoder setting, applied in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderParam {
    InputFormat(InputColorSpace),
    /// Layout of the raw input (interleaving, plane order)
    InputPixelFormat(PixelFormat),
    Sampling(SamplingMode),
    Width(u32),
    Height(u32),
    Quality(u32),
    ThumbnailEnabled(bool),
    ThumbnailWidth(u32),
    ThumbnailHeight(u32),
}

/// Thumbnail geometry embedded alongside the main image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    pub resolution: Resolution,
    pub quality: u32,
}

/// Encoder session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeConfig {
    pub resolution: Resolution,
    /// Layout of the raw frames that will be submitted
    pub input_format: PixelFormat,
    /// JPEG quality (1-100)
    pub quality: u32,
    /// None disables the thumbnail
    pub thumbnail: Option<ThumbnailConfig>,
}

impl EncodeConfig {
    pub fn new(resolution: Resolution, input_format: PixelFormat, quality: u32) -> Self {
        Self {
            resolution,
            input_format,
            quality,
            thumbnail: None,
        }
    }

    pub fn with_thumbnail(mut self, resolution: Resolution, quality: u32) -> Self {
        self.thumbnail = Some(ThumbnailConfig {
            resolution,
            quality,
        });
        self
    }

    /// Expand into the ordered parameter list sent to the device
    pub fn params(&self) -> Result<Vec<EncoderParam>> {
        if !self.resolution.is_valid() {
            return Err(CameraError::EncodeConfigError(format!(
                "Invalid encode resolution {}",
                self.resolution
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(CameraError::EncodeConfigError(format!(
                "JPEG quality {} out of range 1-100",
                self.quality
            )));
        }
        let sampling = SamplingMode::for_format(self.input_format)?;

        let mut params = vec![
            EncoderParam::InputFormat(InputColorSpace::YCbCr),
            EncoderParam::InputPixelFormat(self.input_format),
            EncoderParam::Sampling(sampling),
            EncoderParam::Width(self.resolution.width),
            EncoderParam::Height(self.resolution.height),
            EncoderParam::Quality(self.quality),
        ];
        match self.thumbnail {
            Some(thumb) => {
                params.push(EncoderParam::ThumbnailEnabled(true));
                params.push(EncoderParam::ThumbnailWidth(thumb.resolution.width));
                params.push(EncoderParam::ThumbnailHeight(thumb.resolution.height));
            }
            None => params.push(EncoderParam::ThumbnailEnabled(false)),
        }
        Ok(params)
    }
}

/// GPS tags attached to a still image
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpsInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub processing_method: Option<String>,
}

/// Image metadata handed to the encoder with each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExifInfo {
    pub make: String,
    pub model: String,
    pub software: String,
    /// "YYYY:MM:DD HH:MM:SS"
    pub date_time: String,
    pub width: u32,
    pub height: u32,
    /// EXIF orientation tag (1, 3, 6 or 8)
    pub orientation: u16,
    pub focal_length: f32,
    pub gps: Option<GpsInfo>,
    pub thumbnail: Option<Resolution>,
}

impl ExifInfo {
    pub fn new(resolution: Resolution, rotation: u32, captured_at: DateTime<Local>) -> Self {
        Self {
            make: "capture-hal".to_string(),
            model: "camera".to_string(),
            software: format!("capture-hal {}", env!("CARGO_PKG_VERSION")),
            date_time: captured_at.format("%Y:%m:%d %H:%M:%S").to_string(),
            width: resolution.width,
            height: resolution.height,
            orientation: orientation_tag(rotation),
            focal_length: 0.0,
            gps: None,
            thumbnail: None,
        }
    }
}

/// EXIF orientation tag for a clockwise rotation in degrees
pub fn orientation_tag(rotation: u32) -> u16 {
    match rotation % 360 {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

/// Frame handed to [`EncoderDevice`]
#[derive(Debug, Clone, Copy)]
pub enum EncodeInput<'a> {
    /// Raw frame bytes, copied into the encoder input buffer
    Frame(&'a [u8]),
    /// Zero-copy handoff of a captured buffer
    Physical { y: PhysAddr, cbcr: PhysAddr },
}

/// Hardware (or software) still image encoder.
///
/// A device is configured with [`EncoderParam`]s, given one input frame,
/// then asked to encode. The output stays valid until the next encode.
pub trait EncoderDevice: Send {
    fn name(&self) -> &str;

    fn set_param(&mut self, param: EncoderParam) -> Result<()>;

    /// Whether [`EncoderDevice::set_input_physical`] is supported
    fn supports_physical_input(&self) -> bool;

    /// Writable input buffer of at least `len` bytes
    fn input_buffer(&mut self, len: usize) -> Result<&mut [u8]>;

    fn set_input_physical(&mut self, y: PhysAddr, cbcr: PhysAddr) -> Result<()>;

    fn encode(&mut self, exif: &ExifInfo) -> Result<()>;

    /// Main image of the last encode
    fn output(&self) -> Result<&[u8]>;

    /// Thumbnail of the last encode, when enabled
    fn thumbnail_output(&self) -> Option<&[u8]>;

    /// Release the device session
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_for_format() {
        assert_eq!(
            SamplingMode::for_format(PixelFormat::Nv21).unwrap(),
            SamplingMode::Yuv420
        );
        assert_eq!(
            SamplingMode::for_format(PixelFormat::Uyvy).unwrap(),
            SamplingMode::Yuv422
        );
        assert!(matches!(
            SamplingMode::for_format(PixelFormat::Rgb565),
            Err(CameraError::EncodeConfigError(_))
        ));
    }

    #[test]
    fn test_config_params_order() {
        let config = EncodeConfig::new(Resolution::VGA, PixelFormat::Yuyv, 90)
            .with_thumbnail(Resolution::QVGA, 90);
        let params = config.params().unwrap();
        assert_eq!(params[0], EncoderParam::InputFormat(InputColorSpace::YCbCr));
        assert_eq!(params[2], EncoderParam::Sampling(SamplingMode::Yuv422));
        assert_eq!(params[3], EncoderParam::Width(640));
        assert_eq!(params[5], EncoderParam::Quality(90));
        assert_eq!(params[6], EncoderParam::ThumbnailEnabled(true));
        assert_eq!(params[8], EncoderParam::ThumbnailHeight(240));
    }

    #[test]
    fn test_config_rejects_bad_quality() {
        let config = EncodeConfig::new(Resolution::VGA, PixelFormat::Nv12, 0);
        assert!(matches!(
            config.params(),
            Err(CameraError::EncodeConfigError(_))
        ));
    }

    #[test]
    fn test_orientation_tag() {
        assert_eq!(orientation_tag(0), 1);
        assert_eq!(orientation_tag(90), 6);
        assert_eq!(orientation_tag(180), 3);
        assert_eq!(orientation_tag(270), 8);
        assert_eq!(orientation_tag(360), 1);
    }
}
