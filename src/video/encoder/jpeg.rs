//! Software JPEG encoder device
//!
//! Stands in for a hardware still encoder on hosts without one. Input
//! frames are converted to planar 4:2:0 and compressed with turbojpeg;
//! the optional thumbnail is a nearest-neighbour downscale of the same frame.
//!
//! ```text
//! NV12/NV21/YUYV/UYVY/YUV422P ──convert──> I420 ──turbojpeg──> JPEG
//! ```

use tracing::debug;

use super::traits::{EncoderDevice, EncoderParam, ExifInfo, InputColorSpace};
use crate::error::{CameraError, Result};
use crate::video::convert::{scale_yuv420p, PixelConverter};
use crate::video::device::PhysAddr;
use crate::video::format::{PixelFormat, Resolution};

/// Thumbnails are compressed at a fixed quality
const THUMBNAIL_QUALITY: i32 = 90;

/// JPEG encoder device backed by turbojpeg
///
/// Note: turbojpeg handles are not thread-safe; the device is owned by a
/// single encode session at a time.
pub struct TurboJpegEncoder {
    compressor: turbojpeg::Compressor,
    input_format: PixelFormat,
    color_space: InputColorSpace,
    width: u32,
    height: u32,
    quality: u32,
    thumbnail: bool,
    thumb_width: u32,
    thumb_height: u32,
    input: Vec<u8>,
    input_len: usize,
    output: Vec<u8>,
    thumbnail_output: Vec<u8>,
}

impl TurboJpegEncoder {
    pub fn new() -> Result<Self> {
        let compressor = turbojpeg::Compressor::new().map_err(|e| {
            CameraError::EncodeError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        Ok(Self {
            compressor,
            input_format: PixelFormat::Yuv420,
            color_space: InputColorSpace::YCbCr,
            width: 0,
            height: 0,
            quality: 100,
            thumbnail: false,
            thumb_width: 0,
            thumb_height: 0,
            input: Vec::new(),
            input_len: 0,
            output: Vec::new(),
            thumbnail_output: Vec::new(),
        })
    }

    fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Encode I420 data using turbojpeg's YUV path
    fn compress_i420(
        compressor: &mut turbojpeg::Compressor,
        i420: &[u8],
        resolution: Resolution,
        quality: i32,
    ) -> Result<Vec<u8>> {
        compressor
            .set_quality(quality)
            .map_err(|e| CameraError::EncodeError(format!("Failed to set JPEG quality: {}", e)))?;

        let yuv_image = turbojpeg::YuvImage {
            pixels: i420,
            width: resolution.width as usize,
            align: 1,
            height: resolution.height as usize,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };

        compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| CameraError::EncodeError(format!("JPEG compression failed: {}", e)))
    }
}

impl EncoderDevice for TurboJpegEncoder {
    fn name(&self) -> &str {
        "JPEG (turbojpeg)"
    }

    fn set_param(&mut self, param: EncoderParam) -> Result<()> {
        match param {
            EncoderParam::InputFormat(space) => self.color_space = space,
            EncoderParam::InputPixelFormat(format) => {
                if format == PixelFormat::Nv12t || !PixelConverter::supports(format) {
                    return Err(CameraError::EncodeConfigError(format!(
                        "Software encoder cannot read {} input",
                        format
                    )));
                }
                self.input_format = format;
            }
            // Chroma is always resampled to 4:2:0 before compression
            EncoderParam::Sampling(_) => {}
            EncoderParam::Width(width) => self.width = width,
            EncoderParam::Height(height) => self.height = height,
            EncoderParam::Quality(quality) => {
                if !(1..=100).contains(&quality) {
                    return Err(CameraError::EncodeConfigError(format!(
                        "Quality {} out of range",
                        quality
                    )));
                }
                self.quality = quality;
            }
            EncoderParam::ThumbnailEnabled(enabled) => self.thumbnail = enabled,
            EncoderParam::ThumbnailWidth(width) => self.thumb_width = width,
            EncoderParam::ThumbnailHeight(height) => self.thumb_height = height,
        }
        Ok(())
    }

    fn supports_physical_input(&self) -> bool {
        false
    }

    fn input_buffer(&mut self, len: usize) -> Result<&mut [u8]> {
        if self.input.len() < len {
            self.input.resize(len, 0);
        }
        self.input_len = len;
        Ok(&mut self.input[..len])
    }

    fn set_input_physical(&mut self, y: PhysAddr, _cbcr: PhysAddr) -> Result<()> {
        Err(CameraError::EncodeError(format!(
            "Software encoder cannot read physical address {}",
            y
        )))
    }

    fn encode(&mut self, exif: &ExifInfo) -> Result<()> {
        self.output.clear();
        self.thumbnail_output.clear();

        if self.color_space != InputColorSpace::YCbCr {
            return Err(CameraError::EncodeError(
                "Software encoder only accepts YCbCr input".to_string(),
            ));
        }
        let resolution = self.resolution();
        if self.input_len == 0 {
            return Err(CameraError::EncodeError("No input frame submitted".to_string()));
        }

        let mut converter = PixelConverter::to_yuv420p(self.input_format, resolution)
            .map_err(|e| CameraError::EncodeError(e.to_string()))?;
        let i420 = converter
            .convert(&self.input[..self.input_len])
            .map_err(|e| CameraError::EncodeError(e.to_string()))?;

        self.output = Self::compress_i420(
            &mut self.compressor,
            i420,
            resolution,
            self.quality as i32,
        )?;

        if self.thumbnail {
            let thumb_res = Resolution::new(self.thumb_width, self.thumb_height);
            let scaled = scale_yuv420p(i420, resolution, thumb_res)
                .map_err(|e| CameraError::EncodeError(e.to_string()))?;
            self.thumbnail_output =
                Self::compress_i420(&mut self.compressor, &scaled, thumb_res, THUMBNAIL_QUALITY)?;
        }

        debug!(
            "Encoded {} {} frame ({}) to {} bytes, taken {}",
            resolution,
            self.input_format,
            exif.model,
            self.output.len(),
            exif.date_time
        );
        Ok(())
    }

    fn output(&self) -> Result<&[u8]> {
        if self.output.is_empty() {
            return Err(CameraError::EncodeError("No encoded output".to_string()));
        }
        Ok(&self.output)
    }

    fn thumbnail_output(&self) -> Option<&[u8]> {
        if self.thumbnail_output.is_empty() {
            None
        } else {
            Some(&self.thumbnail_output)
        }
    }

    fn close(&mut self) {
        self.input = Vec::new();
        self.input_len = 0;
        self.output = Vec::new();
        self.thumbnail_output = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn configure(encoder: &mut TurboJpegEncoder, format: PixelFormat, res: Resolution) {
        encoder
            .set_param(EncoderParam::InputFormat(InputColorSpace::YCbCr))
            .unwrap();
        encoder
            .set_param(EncoderParam::InputPixelFormat(format))
            .unwrap();
        encoder.set_param(EncoderParam::Width(res.width)).unwrap();
        encoder.set_param(EncoderParam::Height(res.height)).unwrap();
        encoder.set_param(EncoderParam::Quality(85)).unwrap();
    }

    #[test]
    fn test_encode_yuyv_produces_jpeg() {
        let res = Resolution::new(64, 48);
        let mut encoder = TurboJpegEncoder::new().unwrap();
        configure(&mut encoder, PixelFormat::Yuyv, res);
        encoder.set_param(EncoderParam::ThumbnailEnabled(true)).unwrap();
        encoder.set_param(EncoderParam::ThumbnailWidth(16)).unwrap();
        encoder.set_param(EncoderParam::ThumbnailHeight(12)).unwrap();

        let len = 64 * 48 * 2;
        let input = encoder.input_buffer(len).unwrap();
        for (i, b) in input.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        encoder.encode(&ExifInfo::new(res, 90, Local::now())).unwrap();

        let jpeg = encoder.output().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        let thumb = encoder.thumbnail_output().unwrap();
        assert_eq!(&thumb[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_rejects_tiled_and_physical_input() {
        let mut encoder = TurboJpegEncoder::new().unwrap();
        assert!(matches!(
            encoder.set_param(EncoderParam::InputPixelFormat(PixelFormat::Nv12t)),
            Err(CameraError::EncodeConfigError(_))
        ));
        assert!(!encoder.supports_physical_input());
        assert!(matches!(
            encoder.set_input_physical(PhysAddr(0x1000), PhysAddr(0x2000)),
            Err(CameraError::EncodeError(_))
        ));
    }

    #[test]
    fn test_encode_without_input_fails() {
        let res = Resolution::new(16, 16);
        let mut encoder = TurboJpegEncoder::new().unwrap();
        configure(&mut encoder, PixelFormat::Nv12, res);
        assert!(matches!(
            encoder.encode(&ExifInfo::new(res, 0, Local::now())),
            Err(CameraError::EncodeError(_))
        ));
        assert!(encoder.output().is_err());
    }
}
