//! Frames copied out of capture buffers

use bytes::Bytes;
use std::time::Duration;

use super::format::{PixelFormat, Resolution};

/// A frame copied out of a capture buffer, with metadata.
///
/// Cloning is cheap; the payload is reference counted.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    data: Bytes,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Driver sequence number
    pub sequence: u64,
    /// Monotonic capture time relative to the owning camera's creation
    pub timestamp: Duration,
}

impl CapturedFrame {
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
        timestamp: Duration,
    ) -> Self {
        Self {
            data,
            resolution,
            format,
            sequence,
            timestamp,
        }
    }

    /// Copy `data` into a new frame
    pub fn copy_from(
        data: &[u8],
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
        timestamp: Duration,
    ) -> Self {
        Self::new(
            Bytes::copy_from_slice(data),
            resolution,
            format,
            sequence,
            timestamp,
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keep only the first `len` bytes (sensor JPEG payloads are shorter
    /// than the buffer they arrive in)
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn is_jpeg(&self) -> bool {
        self.format.is_compressed()
    }

    pub fn is_valid_jpeg(&self) -> bool {
        self.is_jpeg() && is_valid_jpeg(&self.data)
    }
}

/// Check SOI and EOI markers of a JPEG bitstream
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let start_marker = ((data[0] as u16) << 8) | data[1] as u16;
    if start_marker != 0xFFD8 {
        return false;
    }
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    // Valid end markers: 0xFFD9, 0xD900, 0x0000 (padded)
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jpeg_markers() {
        assert!(is_valid_jpeg(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]));
        assert!(!is_valid_jpeg(&[0xFF, 0xD8]));
        assert!(!is_valid_jpeg(&[0x00, 0xD8, 0x00, 0xFF, 0xD9]));
    }

    #[test]
    fn test_truncate_sensor_payload() {
        let mut frame = CapturedFrame::copy_from(
            &[0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xAA, 0xAA],
            Resolution::VGA,
            PixelFormat::Jpeg,
            1,
            Duration::ZERO,
        );
        assert!(!frame.is_valid_jpeg());
        frame.truncate(5);
        assert!(frame.is_valid_jpeg());
        assert_eq!(frame.len(), 5);
    }
}
