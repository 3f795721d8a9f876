//! Pixel format definitions and frame geometry

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Width alignment of tiled NV12 (128 bytes)
const TILE_ALIGN_W: u32 = 0x7F;
/// Height alignment of tiled NV12 (32 lines)
const TILE_ALIGN_H: u32 = 0x1F;
/// Plane alignment of tiled NV12 (8 KiB)
const TILE_ALIGN_BUF: u32 = 0x1FFF;

fn align(value: u32, mask: u32) -> u32 {
    (value + mask) & !mask
}

/// Pixel formats understood by the capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// NV12 semi-planar 4:2:0 (Y plane + interleaved CbCr)
    Nv12,
    /// NV12 in 64x32 macroblock tiles, used by the record pipe
    Nv12t,
    /// NV21 semi-planar 4:2:0 (Y plane + interleaved CrCb)
    Nv21,
    /// YUV 4:2:0 planar (I420)
    Yuv420,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// YVYU 4:2:2 packed
    Yvyu,
    /// UYVY 4:2:2 packed
    Uyvy,
    /// VYUY 4:2:2 packed
    Vyuy,
    /// NV16 semi-planar 4:2:2
    Nv16,
    /// NV61 semi-planar 4:2:2
    Nv61,
    /// YUV 4:2:2 planar
    Yuv422p,
    /// RGB565 packed
    Rgb565,
    /// 32-bit RGB
    Rgb32,
    /// JPEG produced by the sensor
    Jpeg,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        fourcc::FourCC::new(self.fourcc_bytes())
    }

    fn fourcc_bytes(&self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Nv12t => b"TV12",
            PixelFormat::Nv21 => b"NV21",
            PixelFormat::Yuv420 => b"YU12",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Yvyu => b"YVYU",
            PixelFormat::Uyvy => b"UYVY",
            PixelFormat::Vyuy => b"VYUY",
            PixelFormat::Nv16 => b"NV16",
            PixelFormat::Nv61 => b"NV61",
            PixelFormat::Yuv422p => b"422P",
            PixelFormat::Rgb565 => b"RGBP",
            PixelFormat::Rgb32 => b"RGB4",
            PixelFormat::Jpeg => b"JPEG",
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        Self::from_fourcc_bytes(&fourcc.repr)
    }

    /// Try to convert from the raw little-endian FourCC code used by ioctls
    pub fn from_fourcc_code(code: u32) -> Option<Self> {
        Self::from_fourcc_bytes(&code.to_le_bytes())
    }

    /// Raw little-endian FourCC code used by ioctls
    pub fn fourcc_code(&self) -> u32 {
        u32::from_le_bytes(*self.fourcc_bytes())
    }

    fn from_fourcc_bytes(repr: &[u8; 4]) -> Option<Self> {
        match repr {
            b"NV12" => Some(PixelFormat::Nv12),
            b"TV12" => Some(PixelFormat::Nv12t),
            b"NV21" => Some(PixelFormat::Nv21),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"YVYU" => Some(PixelFormat::Yvyu),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"VYUY" => Some(PixelFormat::Vyuy),
            b"NV16" => Some(PixelFormat::Nv16),
            b"NV61" => Some(PixelFormat::Nv61),
            b"422P" => Some(PixelFormat::Yuv422p),
            b"RGBP" => Some(PixelFormat::Rgb565),
            b"RGB4" => Some(PixelFormat::Rgb32),
            b"JPEG" | b"MJPG" => Some(PixelFormat::Jpeg),
            _ => None,
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Jpeg)
    }

    /// Bits per pixel used for format negotiation.
    /// Returns 0 for compressed formats.
    pub fn depth(&self) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv12t | PixelFormat::Nv21 | PixelFormat::Yuv420 => 12,
            PixelFormat::Rgb565
            | PixelFormat::Yuyv
            | PixelFormat::Yvyu
            | PixelFormat::Uyvy
            | PixelFormat::Vyuy
            | PixelFormat::Nv16
            | PixelFormat::Nv61
            | PixelFormat::Yuv422p => 16,
            PixelFormat::Rgb32 => 32,
            PixelFormat::Jpeg => 0,
        }
    }

    /// Image size announced to the driver during negotiation
    pub fn image_size(&self, resolution: Resolution) -> u32 {
        (resolution.pixels() * self.depth() as u64 / 8) as u32
    }

    /// Size of one captured frame in memory.
    /// Returns None for compressed formats (variable size).
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let (w, h) = (resolution.width, resolution.height);
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420 => Some(pixels * 3 / 2),
            PixelFormat::Nv12t => {
                let luma = align(align(w, TILE_ALIGN_W) * align(h, TILE_ALIGN_H), TILE_ALIGN_BUF);
                let chroma =
                    align(align(w, TILE_ALIGN_W) * align(h / 2, TILE_ALIGN_H), TILE_ALIGN_BUF);
                Some((luma + chroma) as usize)
            }
            PixelFormat::Yuyv
            | PixelFormat::Yvyu
            | PixelFormat::Uyvy
            | PixelFormat::Vyuy
            | PixelFormat::Nv16
            | PixelFormat::Nv61
            | PixelFormat::Yuv422p
            | PixelFormat::Rgb565 => Some(pixels * 2),
            PixelFormat::Rgb32 => Some(pixels * 4),
            PixelFormat::Jpeg => None,
        }
    }

    /// Whether the format carries 4:2:0 chroma
    pub fn is_yuv420(&self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12 | PixelFormat::Nv12t | PixelFormat::Nv21 | PixelFormat::Yuv420
        )
    }

    /// Whether the format carries 4:2:2 chroma
    pub fn is_yuv422(&self) -> bool {
        matches!(
            self,
            PixelFormat::Yuyv
                | PixelFormat::Yvyu
                | PixelFormat::Uyvy
                | PixelFormat::Vyuy
                | PixelFormat::Nv16
                | PixelFormat::Nv61
                | PixelFormat::Yuv422p
        )
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv12t => "NV12T",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Yvyu => "YVYU",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Vyuy => "VYUY",
            PixelFormat::Nv16 => "NV16",
            PixelFormat::Nv61 => "NV61",
            PixelFormat::Yuv422p => "YUV422P",
            PixelFormat::Rgb565 => "RGB565",
            PixelFormat::Rgb32 => "RGB32",
            PixelFormat::Jpeg => "JPEG",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NV12" => Ok(PixelFormat::Nv12),
            "NV12T" => Ok(PixelFormat::Nv12t),
            "NV21" => Ok(PixelFormat::Nv21),
            "YUV420" | "I420" => Ok(PixelFormat::Yuv420),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "YVYU" => Ok(PixelFormat::Yvyu),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "VYUY" => Ok(PixelFormat::Vyuy),
            "NV16" => Ok(PixelFormat::Nv16),
            "NV61" => Ok(PixelFormat::Nv61),
            "YUV422P" => Ok(PixelFormat::Yuv422p),
            "RGB565" => Ok(PixelFormat::Rgb565),
            "RGB32" => Ok(PixelFormat::Rgb32),
            "JPEG" => Ok(PixelFormat::Jpeg),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check that both dimensions are non-zero
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const QCIF: Resolution = Resolution {
        width: 176,
        height: 144,
    };
    pub const QVGA: Resolution = Resolution {
        width: 320,
        height: 240,
    };
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const WVGA: Resolution = Resolution {
        width: 800,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once('x')
            .ok_or_else(|| format!("Invalid resolution: {}", s))?;
        let width = w
            .parse::<u32>()
            .map_err(|_| format!("Invalid resolution width: {}", s))?;
        let height = h
            .parse::<u32>()
            .map_err(|_| format!("Invalid resolution height: {}", s))?;
        Ok(Resolution::new(width, height))
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip_for_tiled_format() {
        let fourcc = PixelFormat::Nv12t.to_fourcc();
        assert_eq!(PixelFormat::from_fourcc(fourcc), Some(PixelFormat::Nv12t));
        assert_eq!(
            PixelFormat::from_fourcc_code(PixelFormat::Yuv420.fourcc_code()),
            Some(PixelFormat::Yuv420)
        );
    }

    #[test]
    fn test_depth_and_image_size() {
        assert_eq!(PixelFormat::Nv21.depth(), 12);
        assert_eq!(PixelFormat::Yuv422p.depth(), 16);
        assert_eq!(PixelFormat::Rgb32.depth(), 32);
        assert_eq!(PixelFormat::Yuyv.image_size(Resolution::VGA), 640 * 480 * 2);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(
            PixelFormat::Yuv420.frame_size(Resolution::VGA),
            Some(640 * 480 * 3 / 2)
        );
        assert_eq!(
            PixelFormat::Uyvy.frame_size(Resolution::QVGA),
            Some(320 * 240 * 2)
        );
        assert_eq!(PixelFormat::Jpeg.frame_size(Resolution::VGA), None);
    }

    #[test]
    fn test_tiled_frame_size_is_aligned() {
        // 176 -> 256 wide, 144 -> 160 tall, 72 -> 96 tall, each plane rounded to 8K
        let size = PixelFormat::Nv12t.frame_size(Resolution::QCIF).unwrap();
        assert_eq!(size, 40960 + 24576);
        assert_eq!(size % 8192, 0);
    }

    #[test]
    fn test_resolution_parse() {
        let res: Resolution = "800x480".parse().unwrap();
        assert_eq!(res, Resolution::WVGA);
        assert_eq!(res.to_string(), "800x480");
        assert!("800".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("nv12t".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12t);
        assert!("mpeg".parse::<PixelFormat>().is_err());
    }
}
