// SPDX-License-Identifier: MPL-2.0

//! Still image compression
//!
//! The picture path hands raw frames to a [`JpegEncoder`]. Hardware with a
//! JPEG block provides its own implementation; [`SoftwareJpegEncoder`]
//! converts the frame to RGB and compresses it with the `image` crate.

use crate::backends::camera::types::PixelFormat;
use crate::constants::memory::align;
use crate::errors::{CameraError, CameraResult};
use image::RgbImage;
use tracing::debug;

/// Compresses one raw frame into a baseline JPEG stream
pub trait JpegEncoder: Send + Sync {
    /// Encode `raw`, laid out as `format` at `width`x`height`
    ///
    /// `quality` is 1 to 100. The returned stream starts with SOI.
    fn encode(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        quality: u8,
    ) -> CameraResult<Vec<u8>>;
}

/// JPEG encoder running on the CPU
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareJpegEncoder;

impl SoftwareJpegEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl JpegEncoder for SoftwareJpegEncoder {
    fn encode(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        quality: u8,
    ) -> CameraResult<Vec<u8>> {
        if width == 0 || height == 0 {
            return Err(CameraError::Encoding(format!(
                "invalid size {}x{}",
                width, height
            )));
        }

        let image = to_rgb(raw, width, height, format)?;
        let quality = quality.clamp(1, 100);

        let mut buffer = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buffer);
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
        encoder
            .encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| CameraError::Encoding(format!("JPEG encoding failed: {}", e)))?;

        debug!(width, height, %format, quality, size = buffer.len(), "Encoded JPEG");
        Ok(buffer)
    }
}

/// Convert a raw frame to RGB
///
/// Plane offsets follow the same layout the reshaping hardware writes:
/// NV12 and YUV420 chroma start on a 64 KiB boundary, NV21 chroma directly
/// after luma.
pub fn to_rgb(raw: &[u8], width: u32, height: u32, format: PixelFormat) -> CameraResult<RgbImage> {
    let w = width as usize;
    let h = height as usize;
    let area = w * h;

    let need = |len: usize| -> CameraResult<()> {
        if raw.len() < len {
            Err(CameraError::Encoding(format!(
                "{} bytes is too short for {}x{} {}",
                raw.len(),
                width,
                height,
                format
            )))
        } else {
            Ok(())
        }
    };

    let mut rgb = vec![0u8; area * 3];

    match format {
        PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Yvyu | PixelFormat::Vyuy => {
            need(area * 2)?;
            // Byte positions of Y0, U, Y1, V inside each macropixel
            let (y0, u, y1, v) = match format {
                PixelFormat::Yuyv => (0, 1, 2, 3),
                PixelFormat::Yvyu => (0, 3, 2, 1),
                PixelFormat::Uyvy => (1, 0, 3, 2),
                _ => (1, 2, 3, 0),
            };
            for row in 0..h {
                for pair in 0..w / 2 {
                    let src = (row * w + pair * 2) * 2;
                    let chroma = Chroma::new(raw[src + u], raw[src + v]);
                    let dst = (row * w + pair * 2) * 3;
                    chroma.put(raw[src + y0], &mut rgb[dst..dst + 3]);
                    chroma.put(raw[src + y1], &mut rgb[dst + 3..dst + 6]);
                }
            }
        }
        PixelFormat::Nv12 | PixelFormat::Nv21 => {
            let uv_offset = if format == PixelFormat::Nv12 {
                align(area)
            } else {
                area
            };
            need(uv_offset + area / 2)?;
            let (y_plane, uv_plane) = raw.split_at(uv_offset);
            for row in 0..h {
                for col in 0..w {
                    let uv = (row / 2) * w + (col / 2) * 2;
                    let (u, v) = if format == PixelFormat::Nv12 {
                        (uv_plane[uv], uv_plane[uv + 1])
                    } else {
                        (uv_plane[uv + 1], uv_plane[uv])
                    };
                    let dst = (row * w + col) * 3;
                    Chroma::new(u, v).put(y_plane[row * w + col], &mut rgb[dst..dst + 3]);
                }
            }
        }
        PixelFormat::Yuv420 => {
            let cb_offset = align(area);
            let cr_offset = cb_offset + align(area / 4);
            need(cr_offset + area / 4)?;
            let half = w / 2;
            for row in 0..h {
                for col in 0..w {
                    let c = (row / 2) * half + col / 2;
                    let dst = (row * w + col) * 3;
                    Chroma::new(raw[cb_offset + c], raw[cr_offset + c])
                        .put(raw[row * w + col], &mut rgb[dst..dst + 3]);
                }
            }
        }
        PixelFormat::Rgb565 => {
            need(area * 2)?;
            for (i, px) in raw[..area * 2].chunks_exact(2).enumerate() {
                let value = u16::from_le_bytes([px[0], px[1]]);
                let r = ((value >> 11) & 0x1f) as u8;
                let g = ((value >> 5) & 0x3f) as u8;
                let b = (value & 0x1f) as u8;
                rgb[i * 3] = (r << 3) | (r >> 2);
                rgb[i * 3 + 1] = (g << 2) | (g >> 4);
                rgb[i * 3 + 2] = (b << 3) | (b >> 2);
            }
        }
        PixelFormat::Rgb32 => {
            need(area * 4)?;
            for (i, px) in raw[..area * 4].chunks_exact(4).enumerate() {
                rgb[i * 3..i * 3 + 3].copy_from_slice(&px[..3]);
            }
        }
        other => {
            return Err(CameraError::Encoding(format!(
                "no RGB conversion for {}",
                other
            )));
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| CameraError::Encoding("Failed to create RGB image from buffer".to_string()))
}

/// Precomputed chroma contributions shared by neighbouring pixels
struct Chroma {
    r_v: i32,
    g_u: i32,
    g_v: i32,
    b_u: i32,
}

impl Chroma {
    #[inline]
    fn new(u: u8, v: u8) -> Self {
        let u = u as i32 - 128;
        let v = v as i32 - 128;
        Self {
            r_v: (179 * v) >> 7,
            g_u: (44 * u) >> 7,
            g_v: (91 * v) >> 7,
            b_u: (227 * u) >> 7,
        }
    }

    #[inline]
    fn put(&self, y: u8, out: &mut [u8]) {
        let y = ((y as i32 - 16) * 149) >> 7;
        out[0] = (y + self.r_v).clamp(0, 255) as u8;
        out[1] = (y - self.g_u - self.g_v).clamp(0, 255) as u8;
        out[2] = (y + self.b_u).clamp(0, 255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::output::buffer_length;
    use crate::backends::camera::types::Geometry;

    fn gray(format: PixelFormat, width: u32, height: u32) -> Vec<u8> {
        let len = buffer_length(Geometry::new(width, height), format).unwrap();
        vec![128u8; len]
    }

    #[test]
    fn test_encodes_supported_formats() {
        let encoder = SoftwareJpegEncoder::new();
        for format in [
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Nv21,
            PixelFormat::Nv12,
            PixelFormat::Yuv420,
            PixelFormat::Rgb565,
            PixelFormat::Rgb32,
        ] {
            let raw = gray(format, 32, 16);
            let jpeg = encoder.encode(&raw, 32, 16, format, 90).unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "{}", format);
            assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9], "{}", format);
        }
    }

    #[test]
    fn test_mid_gray_converts_to_gray() {
        let raw = gray(PixelFormat::Yuyv, 4, 2);
        let image = to_rgb(&raw, 4, 2, PixelFormat::Yuyv).unwrap();
        let px = image.get_pixel(1, 1);
        // (128 - 16) * 149 >> 7
        assert_eq!(px.0, [130, 130, 130]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let encoder = SoftwareJpegEncoder::new();
        let result = encoder.encode(&[0u8; 10], 32, 16, PixelFormat::Yuyv, 90);
        assert!(matches!(result, Err(CameraError::Encoding(_))));
    }

    #[test]
    fn test_compressed_input_rejected() {
        let encoder = SoftwareJpegEncoder::new();
        let result = encoder.encode(&[0u8; 64], 4, 4, PixelFormat::Jpeg, 90);
        assert!(matches!(result, Err(CameraError::Encoding(_))));
    }

    #[test]
    fn test_rgb565_expansion() {
        // Pure red, pure green
        let raw = [0x00, 0xF8, 0xE0, 0x07];
        let image = to_rgb(&raw, 2, 1, PixelFormat::Rgb565).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 255, 0]);
    }
}
