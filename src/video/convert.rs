//! Pixel format conversion utilities
//!
//! Software conversions between the layouts the capture pipeline produces
//! and the layouts its consumers expect: planar 4:2:0 for the JPEG encoder,
//! YV12 for display buffers, NV21 for client preview copies.

use crate::error::{CameraError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// YUV420P buffer with separate Y, U, V planes
pub struct Yuv420pBuffer {
    data: Vec<u8>,
    resolution: Resolution,
    u_offset: usize,
    v_offset: usize,
}

impl Yuv420pBuffer {
    /// Create a new YUV420P buffer for the given resolution
    pub fn new(resolution: Resolution) -> Self {
        let y_size = resolution.pixels() as usize;
        let uv_size = y_size / 4;
        Self {
            data: vec![0u8; y_size + uv_size * 2],
            resolution,
            u_offset: y_size,
            v_offset: y_size + uv_size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    /// Split into mutable (Y, U, V) planes
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y, uv) = self.data.split_at_mut(self.u_offset);
        let (u, v) = uv.split_at_mut(self.v_offset - self.u_offset);
        (y, u, v)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Calculate YUV420P buffer size for a given resolution
pub fn yuv420p_buffer_size(resolution: Resolution) -> usize {
    let pixels = resolution.pixels() as usize;
    pixels + pixels / 2
}

fn check_input(input: &[u8], expected: usize, format: PixelFormat) -> Result<()> {
    if input.len() < expected {
        return Err(CameraError::InvalidArgument(format!(
            "{} input too small: {} < {}",
            format,
            input.len(),
            expected
        )));
    }
    Ok(())
}

/// Converter from a captured layout into planar 4:2:0.
///
/// The output buffer is reused across conversions.
pub struct PixelConverter {
    src_format: PixelFormat,
    output_buffer: Yuv420pBuffer,
}

impl PixelConverter {
    /// Create a converter for `src_format` frames of `resolution`.
    /// Width and height must be even.
    pub fn to_yuv420p(src_format: PixelFormat, resolution: Resolution) -> Result<Self> {
        if !Self::supports(src_format) {
            return Err(CameraError::UnsupportedFormat(format!(
                "No planar conversion from {}",
                src_format
            )));
        }
        if resolution.width % 2 != 0 || resolution.height % 2 != 0 || !resolution.is_valid() {
            return Err(CameraError::InvalidArgument(format!(
                "Conversion requires even dimensions, got {}",
                resolution
            )));
        }
        Ok(Self {
            src_format,
            output_buffer: Yuv420pBuffer::new(resolution),
        })
    }

    /// Whether `format` can be converted to planar 4:2:0
    pub fn supports(format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Yuv420
                | PixelFormat::Nv12
                | PixelFormat::Nv21
                | PixelFormat::Yuyv
                | PixelFormat::Yvyu
                | PixelFormat::Uyvy
                | PixelFormat::Vyuy
                | PixelFormat::Yuv422p
        )
    }

    /// Convert a frame and return reference to the output buffer
    pub fn convert(&mut self, input: &[u8]) -> Result<&[u8]> {
        let resolution = self.output_buffer.resolution();
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        let y_size = width * height;

        match self.src_format {
            PixelFormat::Yuv420 => {
                let expected = self.output_buffer.len();
                check_input(input, expected, self.src_format)?;
                self.output_buffer
                    .as_bytes_mut()
                    .copy_from_slice(&input[..expected]);
            }
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                check_input(input, y_size + y_size / 2, self.src_format)?;
                let (u_first, v_first) = if self.src_format == PixelFormat::Nv12 {
                    (0, 1)
                } else {
                    (1, 0)
                };
                let (y_plane, u_plane, v_plane) = self.output_buffer.planes_mut();
                y_plane.copy_from_slice(&input[..y_size]);
                for (i, pair) in input[y_size..y_size + y_size / 2].chunks_exact(2).enumerate() {
                    u_plane[i] = pair[u_first];
                    v_plane[i] = pair[v_first];
                }
            }
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy | PixelFormat::Vyuy => {
                check_input(input, y_size * 2, self.src_format)?;
                // Byte offsets of (Y0, U, Y1, V) within each 4-byte macropixel
                let (y0, u, y1, v) = match self.src_format {
                    PixelFormat::Yuyv => (0, 1, 2, 3),
                    PixelFormat::Yvyu => (0, 3, 2, 1),
                    PixelFormat::Uyvy => (1, 0, 3, 2),
                    _ => (1, 2, 3, 0),
                };
                packed_422_to_yuv420p(
                    input,
                    width,
                    height,
                    (y0, u, y1, v),
                    self.output_buffer.planes_mut(),
                );
            }
            PixelFormat::Yuv422p => {
                check_input(input, y_size * 2, self.src_format)?;
                let half_width = width / 2;
                let chroma_422 = y_size / 2;
                let (y_plane, u_plane, v_plane) = self.output_buffer.planes_mut();
                y_plane.copy_from_slice(&input[..y_size]);
                let u_src = &input[y_size..y_size + chroma_422];
                let v_src = &input[y_size + chroma_422..y_size + chroma_422 * 2];
                for row in 0..height / 2 {
                    let top = row * 2 * half_width;
                    let bottom = top + half_width;
                    for col in 0..half_width {
                        let dst = row * half_width + col;
                        u_plane[dst] =
                            ((u_src[top + col] as u16 + u_src[bottom + col] as u16) / 2) as u8;
                        v_plane[dst] =
                            ((v_src[top + col] as u16 + v_src[bottom + col] as u16) / 2) as u8;
                    }
                }
            }
            other => {
                return Err(CameraError::UnsupportedFormat(format!(
                    "No planar conversion from {}",
                    other
                )));
            }
        }

        Ok(self.output_buffer.as_bytes())
    }

    pub fn output_len(&self) -> usize {
        self.output_buffer.len()
    }

    pub fn resolution(&self) -> Resolution {
        self.output_buffer.resolution()
    }
}

fn packed_422_to_yuv420p(
    input: &[u8],
    width: usize,
    height: usize,
    (y0, u, y1, v): (usize, usize, usize, usize),
    (y_plane, u_plane, v_plane): (&mut [u8], &mut [u8], &mut [u8]),
) {
    let half_width = width / 2;
    for row in (0..height).step_by(2) {
        let src_row0 = row * width * 2;
        let src_row1 = (row + 1) * width * 2;
        let uv_row = (row / 2) * half_width;

        for col in (0..width).step_by(2) {
            let p0 = src_row0 + col * 2;
            let p1 = src_row1 + col * 2;

            y_plane[row * width + col] = input[p0 + y0];
            y_plane[row * width + col + 1] = input[p0 + y1];
            y_plane[(row + 1) * width + col] = input[p1 + y0];
            y_plane[(row + 1) * width + col + 1] = input[p1 + y1];

            let uv_idx = uv_row + col / 2;
            u_plane[uv_idx] = ((input[p0 + u] as u16 + input[p1 + u] as u16) / 2) as u8;
            v_plane[uv_idx] = ((input[p0 + v] as u16 + input[p1 + v] as u16) / 2) as u8;
        }
    }
}

/// Repack a planar 4:2:0 frame as NV21 (Y plane, then interleaved V/U)
pub fn yuv420p_to_nv21(src: &[u8], resolution: Resolution, dst: &mut [u8]) -> Result<()> {
    let y_size = resolution.pixels() as usize;
    let c_size = y_size / 4;
    let total = y_size + c_size * 2;
    check_input(src, total, PixelFormat::Yuv420)?;
    if dst.len() < total {
        return Err(CameraError::InvalidArgument(format!(
            "NV21 output too small: {} < {}",
            dst.len(),
            total
        )));
    }

    dst[..y_size].copy_from_slice(&src[..y_size]);
    let u_src = &src[y_size..y_size + c_size];
    let v_src = &src[y_size + c_size..total];
    for (i, pair) in dst[y_size..total].chunks_exact_mut(2).enumerate() {
        pair[0] = v_src[i];
        pair[1] = u_src[i];
    }
    Ok(())
}

/// Row strides of a YV12 display buffer: (luma, chroma), both 16-byte aligned
pub fn yv12_strides(width: u32) -> (usize, usize) {
    let y_stride = (width as usize + 15) & !15;
    let c_stride = (y_stride / 2 + 15) & !15;
    (y_stride, c_stride)
}

/// Size in bytes of a YV12 display buffer
pub fn yv12_buffer_size(resolution: Resolution) -> usize {
    let (y_stride, c_stride) = yv12_strides(resolution.width);
    let height = resolution.height as usize;
    y_stride * height + c_stride * (height / 2) * 2
}

/// Copy a planar 4:2:0 frame into a stride-aligned YV12 buffer
/// (Y plane, then V, then U).
pub fn copy_yuv420p_to_yv12(src: &[u8], resolution: Resolution, dst: &mut [u8]) -> Result<()> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let y_size = width * height;
    let c_width = width / 2;
    let c_height = height / 2;
    let c_size = c_width * c_height;
    check_input(src, y_size + c_size * 2, PixelFormat::Yuv420)?;

    let (y_stride, c_stride) = yv12_strides(resolution.width);
    let needed = yv12_buffer_size(resolution);
    if dst.len() < needed {
        return Err(CameraError::InvalidArgument(format!(
            "Display buffer too small: {} < {}",
            dst.len(),
            needed
        )));
    }

    for row in 0..height {
        dst[row * y_stride..row * y_stride + width]
            .copy_from_slice(&src[row * width..(row + 1) * width]);
    }

    let v_base = y_stride * height;
    let u_base = v_base + c_stride * c_height;
    let u_src = &src[y_size..y_size + c_size];
    let v_src = &src[y_size + c_size..y_size + c_size * 2];
    for row in 0..c_height {
        let s = row * c_width;
        dst[v_base + row * c_stride..v_base + row * c_stride + c_width]
            .copy_from_slice(&v_src[s..s + c_width]);
        dst[u_base + row * c_stride..u_base + row * c_stride + c_width]
            .copy_from_slice(&u_src[s..s + c_width]);
    }
    Ok(())
}

/// Downscale a packed 4:2:2 image by integer sampling steps.
///
/// Copies one 4-byte macropixel (two pixels) per step, so chroma pairs stay
/// intact. `dst` dimensions must be even and no larger than the source.
pub fn scale_down_yuv422(
    src: &[u8],
    src_res: Resolution,
    dst: &mut [u8],
    dst_res: Resolution,
) -> Result<()> {
    let (sw, sh) = (src_res.width as usize, src_res.height as usize);
    let (dw, dh) = (dst_res.width as usize, dst_res.height as usize);
    if dw == 0 || dh == 0 || dw % 2 != 0 || dh % 2 != 0 || dw > sw || dh > sh {
        return Err(CameraError::InvalidArgument(format!(
            "Cannot scale {} down to {}",
            src_res, dst_res
        )));
    }
    check_input(src, sw * sh * 2, PixelFormat::Yuyv)?;
    if dst.len() < dw * dh * 2 {
        return Err(CameraError::InvalidArgument(format!(
            "Scaled output too small: {} < {}",
            dst.len(),
            dw * dh * 2
        )));
    }

    let step_x = sw / dw;
    let step_y = sh / dh;
    let mut out = 0;
    for y in 0..dh {
        let row = y * step_y * sw * 2;
        for x in (0..dw).step_by(2) {
            // Keep macropixel alignment in the source
            let src_x = (x * step_x) & !1;
            let at = row + src_x * 2;
            dst[out..out + 4].copy_from_slice(&src[at..at + 4]);
            out += 4;
        }
    }
    Ok(())
}

/// Nearest-neighbour resize of a planar 4:2:0 frame
pub fn scale_yuv420p(src: &[u8], src_res: Resolution, dst_res: Resolution) -> Result<Vec<u8>> {
    check_input(src, yuv420p_buffer_size(src_res), PixelFormat::Yuv420)?;
    if !dst_res.is_valid() || dst_res.width % 2 != 0 || dst_res.height % 2 != 0 {
        return Err(CameraError::InvalidArgument(format!(
            "Invalid scale target {}",
            dst_res
        )));
    }

    let (sw, sh) = (src_res.width as usize, src_res.height as usize);
    let (dw, dh) = (dst_res.width as usize, dst_res.height as usize);
    let mut dst = vec![0u8; yuv420p_buffer_size(dst_res)];

    let sample = |plane: &[u8], pw: usize, ph: usize, out: &mut [u8], ow: usize, oh: usize| {
        for y in 0..oh {
            let sy = y * ph / oh;
            for x in 0..ow {
                out[y * ow + x] = plane[sy * pw + x * pw / ow];
            }
        }
    };

    let s_y = sw * sh;
    let s_c = s_y / 4;
    let d_y = dw * dh;
    let d_c = d_y / 4;
    let (dst_y, dst_uv) = dst.split_at_mut(d_y);
    let (dst_u, dst_v) = dst_uv.split_at_mut(d_c);
    sample(&src[..s_y], sw, sh, dst_y, dw, dh);
    sample(&src[s_y..s_y + s_c], sw / 2, sh / 2, dst_u, dw / 2, dh / 2);
    sample(&src[s_y + s_c..s_y + s_c * 2], sw / 2, sh / 2, dst_v, dw / 2, dh / 2);
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar(res: Resolution, y: u8, u: u8, v: u8) -> Vec<u8> {
        let y_size = res.pixels() as usize;
        let mut data = vec![y; y_size];
        data.extend(std::iter::repeat(u).take(y_size / 4));
        data.extend(std::iter::repeat(v).take(y_size / 4));
        data
    }

    #[test]
    fn test_yuv420p_buffer_size() {
        assert_eq!(yuv420p_buffer_size(Resolution::VGA), 640 * 480 * 3 / 2);
        let buffer = Yuv420pBuffer::new(Resolution::QVGA);
        assert_eq!(buffer.y_plane().len(), 320 * 240);
        assert_eq!(buffer.u_plane().len(), 320 * 240 / 4);
        assert_eq!(buffer.v_plane().len(), 320 * 240 / 4);
    }

    #[test]
    fn test_yuyv_to_planar() {
        let res = Resolution::new(4, 2);
        // Two rows of YUYV: Y=10.., U=100/120, V=200/220
        let input = [
            10, 100, 11, 200, 12, 100, 13, 200, //
            20, 120, 21, 220, 22, 120, 23, 220,
        ];
        let mut converter = PixelConverter::to_yuv420p(PixelFormat::Yuyv, res).unwrap();
        let out = converter.convert(&input).unwrap();
        assert_eq!(&out[..8], &[10, 11, 12, 13, 20, 21, 22, 23]);
        assert_eq!(&out[8..10], &[110, 110]);
        assert_eq!(&out[10..12], &[210, 210]);
    }

    #[test]
    fn test_uyvy_to_planar() {
        let res = Resolution::new(2, 2);
        let input = [100, 10, 200, 11, 100, 20, 200, 21];
        let mut converter = PixelConverter::to_yuv420p(PixelFormat::Uyvy, res).unwrap();
        let out = converter.convert(&input).unwrap();
        assert_eq!(out, &[10, 11, 20, 21, 100, 200]);
    }

    #[test]
    fn test_nv21_to_planar_swaps_chroma() {
        let res = Resolution::new(2, 2);
        let input = [1, 2, 3, 4, 90, 60];
        let mut converter = PixelConverter::to_yuv420p(PixelFormat::Nv21, res).unwrap();
        let out = converter.convert(&input).unwrap();
        assert_eq!(out, &[1, 2, 3, 4, 60, 90]);
    }

    #[test]
    fn test_converter_rejects_short_input_and_rgb() {
        let mut converter = PixelConverter::to_yuv420p(PixelFormat::Nv12, Resolution::QVGA).unwrap();
        assert!(matches!(
            converter.convert(&[0u8; 16]),
            Err(CameraError::InvalidArgument(_))
        ));
        assert!(matches!(
            PixelConverter::to_yuv420p(PixelFormat::Rgb565, Resolution::QVGA),
            Err(CameraError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_planar_to_nv21() {
        let res = Resolution::new(2, 2);
        let src = planar(res, 5, 60, 90);
        let mut dst = vec![0u8; 6];
        yuv420p_to_nv21(&src, res, &mut dst).unwrap();
        assert_eq!(dst, vec![5, 5, 5, 5, 90, 60]);
    }

    #[test]
    fn test_yv12_copy_respects_stride() {
        let res = Resolution::new(20, 2);
        let (y_stride, c_stride) = yv12_strides(20);
        assert_eq!(y_stride, 32);
        assert_eq!(c_stride, 16);

        let src = planar(res, 7, 60, 90);
        let mut dst = vec![0u8; yv12_buffer_size(res)];
        copy_yuv420p_to_yv12(&src, res, &mut dst).unwrap();

        assert_eq!(dst[0], 7);
        assert_eq!(dst[19], 7);
        // Stride padding untouched
        assert_eq!(dst[20], 0);
        assert_eq!(dst[32], 7);
        // V plane comes first in YV12
        assert_eq!(dst[64], 90);
        assert_eq!(dst[64 + 16], 60);
    }

    #[test]
    fn test_scale_down_yuv422() {
        let src_res = Resolution::new(8, 4);
        let src: Vec<u8> = (0..(8 * 4 * 2) as u8).collect();
        let mut dst = vec![0u8; 4 * 2 * 2];
        scale_down_yuv422(&src, src_res, &mut dst, Resolution::new(4, 2)).unwrap();
        // Row 0: macropixels at source x=0 and x=4; row 1 from source row 2
        assert_eq!(&dst[..8], &[0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(&dst[8..12], &[32, 33, 34, 35]);

        assert!(scale_down_yuv422(&src, src_res, &mut dst, Resolution::new(3, 2)).is_err());
    }

    #[test]
    fn test_scale_yuv420p_nearest() {
        let src = planar(Resolution::VGA, 50, 60, 70);
        let out = scale_yuv420p(&src, Resolution::VGA, Resolution::QVGA).unwrap();
        assert_eq!(out.len(), yuv420p_buffer_size(Resolution::QVGA));
        assert!(out[..320 * 240].iter().all(|&b| b == 50));
        assert_eq!(out[320 * 240], 60);
        assert_eq!(*out.last().unwrap(), 70);
    }
}
