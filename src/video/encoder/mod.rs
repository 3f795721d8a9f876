//! Still image encoding
//!
//! This module provides:
//! - The encoder device control surface ([`EncoderDevice`])
//! - [`EncodeBridge`], a scoped session that configures a device and
//!   retrieves its bitstream
//! - A turbojpeg software device for hosts without a hardware encoder

pub mod bridge;
pub mod jpeg;
pub mod traits;

pub use bridge::{EncodeBridge, EncodedImage};
pub use jpeg::TurboJpegEncoder;
pub use traits::{
    orientation_tag, EncodeConfig, EncodeInput, EncoderDevice, EncoderParam, ExifInfo, GpsInfo,
    InputColorSpace, SamplingMode, ThumbnailConfig,
};
