//! Colorspace conversion between NV12 surfaces and packed BGRA/RGBA.
//!
//! Pure fixed-point implementations of the BT.601 and BT.709 matrices in
//! both studio (16..235) and full (0..255) swing. Hardware backends run
//! the equivalent conversion on the device; the software backend and the
//! probe path use these directly.

use crate::error::{Error, Result};
use crate::format::{ColorMatrix, ColorRange, PixelFormat};

/// YUV → RGB coefficients scaled by 1024.
struct YuvToRgb {
    y_scale: i32,
    y_offset: i32,
    r_v: i32,
    g_u: i32,
    g_v: i32,
    b_u: i32,
}

/// RGB → YUV coefficients scaled by 1024.
struct RgbToYuv {
    y_r: i32,
    y_g: i32,
    y_b: i32,
    y_offset: i32,
    u_r: i32,
    u_g: i32,
    u_b: i32,
    v_r: i32,
    v_g: i32,
    v_b: i32,
}

fn yuv_to_rgb_coeffs(matrix: ColorMatrix, range: ColorRange) -> YuvToRgb {
    match (matrix, range) {
        (ColorMatrix::Bt601, ColorRange::Full) => YuvToRgb {
            y_scale: 1024,
            y_offset: 0,
            r_v: 1436, // 1.402
            g_u: 352,  // 0.344136
            g_v: 731,  // 0.714136
            b_u: 1815, // 1.772
        },
        (ColorMatrix::Bt709, ColorRange::Full) => YuvToRgb {
            y_scale: 1024,
            y_offset: 0,
            r_v: 1613, // 1.5748
            g_u: 192,  // 0.18732
            g_v: 479,  // 0.46812
            b_u: 1900, // 1.8556
        },
        (ColorMatrix::Bt601, ColorRange::Studio) => YuvToRgb {
            y_scale: 1192, // 1.164
            y_offset: 16,
            r_v: 1634, // 1.596
            g_u: 401,  // 0.392
            g_v: 832,  // 0.813
            b_u: 2066, // 2.017
        },
        (ColorMatrix::Bt709, ColorRange::Studio) => YuvToRgb {
            y_scale: 1192, // 1.164
            y_offset: 16,
            r_v: 1836, // 1.793
            g_u: 218,  // 0.213
            g_v: 546,  // 0.533
            b_u: 2163, // 2.112
        },
    }
}

fn rgb_to_yuv_coeffs(matrix: ColorMatrix, range: ColorRange) -> RgbToYuv {
    match (matrix, range) {
        (ColorMatrix::Bt601, ColorRange::Full) => RgbToYuv {
            y_r: 306, // 0.299
            y_g: 601, // 0.587
            y_b: 117, // 0.114
            y_offset: 0,
            u_r: -173, // -0.168736
            u_g: -339, // -0.331264
            u_b: 512,  // 0.5
            v_r: 512,
            v_g: -429, // -0.418688
            v_b: -83,  // -0.081312
        },
        (ColorMatrix::Bt709, ColorRange::Full) => RgbToYuv {
            y_r: 218, // 0.2126
            y_g: 732, // 0.7152
            y_b: 74,  // 0.0722
            y_offset: 0,
            u_r: -117, // -0.1146
            u_g: -395, // -0.3854
            u_b: 512,
            v_r: 512,
            v_g: -465, // -0.4542
            v_b: -47, // -0.0458
        },
        (ColorMatrix::Bt601, ColorRange::Studio) => RgbToYuv {
            y_r: 263, // 0.257
            y_g: 516, // 0.504
            y_b: 100, // 0.098
            y_offset: 16,
            u_r: -152, // -0.148
            u_g: -298, // -0.291
            u_b: 450,  // 0.439
            v_r: 450,
            v_g: -377, // -0.368
            v_b: -73, // -0.071
        },
        (ColorMatrix::Bt709, ColorRange::Studio) => RgbToYuv {
            y_r: 187, // 0.1826
            y_g: 629, // 0.6142
            y_b: 63,  // 0.0620
            y_offset: 16,
            u_r: -103, // -0.1006
            u_g: -347, // -0.3386
            u_b: 450,  // 0.4392
            v_r: 450,
            v_g: -408, // -0.3989
            v_b: -42, // -0.0403
        },
    }
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Colorspace converter with fixed matrix and range.
///
/// Stateless apart from its parameters; target allocation caching lives
/// in [`OutputRing`](crate::ring::OutputRing).
#[derive(Debug, Clone, Copy)]
pub struct Converter {
    matrix: ColorMatrix,
    range: ColorRange,
}

impl Converter {
    /// Create a converter for the given matrix and range.
    pub fn new(matrix: ColorMatrix, range: ColorRange) -> Self {
        Self { matrix, range }
    }

    /// Configured color matrix.
    pub fn matrix(&self) -> ColorMatrix {
        self.matrix
    }

    /// Configured quantization range.
    pub fn range(&self) -> ColorRange {
        self.range
    }

    fn check(&self, width: u32, height: u32, nv12: usize, packed: usize) -> Result<()> {
        if width % 2 != 0 || height % 2 != 0 {
            return Err(Error::OddDimensions { width, height });
        }
        let need_yuv = PixelFormat::Nv12.buffer_size(width, height);
        let need_rgb = PixelFormat::Bgra.buffer_size(width, height);
        if nv12 < need_yuv || packed < need_rgb {
            return Err(Error::InvalidData(format!(
                "conversion buffers too small for {width}x{height}"
            )));
        }
        Ok(())
    }

    /// Convert an NV12 frame to packed BGRA.
    pub fn nv12_to_bgra(
        &self,
        width: u32,
        height: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        self.check(width, height, input.len(), output.len())?;
        let c = yuv_to_rgb_coeffs(self.matrix, self.range);
        let w = width as usize;
        let h = height as usize;
        let y_plane = &input[..w * h];
        let uv_plane = &input[w * h..];

        for row in 0..h {
            for col in 0..w {
                let y = (y_plane[row * w + col] as i32 - c.y_offset) * c.y_scale;
                let uv_idx = (row / 2) * w + (col / 2) * 2;
                let u = uv_plane[uv_idx] as i32 - 128;
                let v = uv_plane[uv_idx + 1] as i32 - 128;

                let r = (y + c.r_v * v + 512) >> 10;
                let g = (y - c.g_u * u - c.g_v * v + 512) >> 10;
                let b = (y + c.b_u * u + 512) >> 10;

                let dst = (row * w + col) * 4;
                output[dst] = clamp_u8(b);
                output[dst + 1] = clamp_u8(g);
                output[dst + 2] = clamp_u8(r);
                output[dst + 3] = 255;
            }
        }
        Ok(())
    }

    /// Convert a packed BGRA frame to NV12, averaging chroma over 2x2 blocks.
    pub fn bgra_to_nv12(
        &self,
        width: u32,
        height: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        self.check(width, height, output.len(), input.len())?;
        let c = rgb_to_yuv_coeffs(self.matrix, self.range);
        let w = width as usize;
        let h = height as usize;
        let y_size = w * h;

        for row in 0..h {
            for col in 0..w {
                let src = (row * w + col) * 4;
                let b = input[src] as i32;
                let g = input[src + 1] as i32;
                let r = input[src + 2] as i32;
                let y = ((c.y_r * r + c.y_g * g + c.y_b * b + 512) >> 10) + c.y_offset;
                output[row * w + col] = clamp_u8(y);
            }
        }

        for row in (0..h).step_by(2) {
            for col in (0..w).step_by(2) {
                let mut u_sum = 0i32;
                let mut v_sum = 0i32;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let src = ((row + dy) * w + (col + dx)) * 4;
                        let b = input[src] as i32;
                        let g = input[src + 1] as i32;
                        let r = input[src + 2] as i32;
                        u_sum += ((c.u_r * r + c.u_g * g + c.u_b * b + 512) >> 10) + 128;
                        v_sum += ((c.v_r * r + c.v_g * g + c.v_b * b + 512) >> 10) + 128;
                    }
                }
                let uv = y_size + (row / 2) * w + (col / 2) * 2;
                output[uv] = clamp_u8(u_sum / 4);
                output[uv + 1] = clamp_u8(v_sum / 4);
            }
        }
        Ok(())
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(ColorMatrix::default(), ColorRange::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_bgra(width: u32, height: u32, b: u8, g: u8, r: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            buf.extend_from_slice(&[b, g, r, 255]);
        }
        buf
    }

    #[test]
    fn full_range_gray_roundtrip_is_near_exact() {
        let conv = Converter::new(ColorMatrix::Bt601, ColorRange::Full);
        let bgra = solid_bgra(16, 16, 128, 128, 128);
        let mut nv12 = vec![0u8; PixelFormat::Nv12.buffer_size(16, 16)];
        conv.bgra_to_nv12(16, 16, &bgra, &mut nv12).unwrap();
        // Neutral gray: chroma at midpoint.
        assert!((nv12[16 * 16] as i32 - 128).abs() <= 1);

        let mut back = vec![0u8; 16 * 16 * 4];
        conv.nv12_to_bgra(16, 16, &nv12, &mut back).unwrap();
        for px in back.chunks(4) {
            for &ch in &px[..3] {
                assert!((ch as i32 - 128).abs() <= 2, "channel {ch} too far from 128");
            }
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn full_range_black_and_white() {
        let conv = Converter::new(ColorMatrix::Bt709, ColorRange::Full);
        for (val, expect) in [(0u8, 0i32), (255u8, 255i32)] {
            let bgra = solid_bgra(8, 8, val, val, val);
            let mut nv12 = vec![0u8; PixelFormat::Nv12.buffer_size(8, 8)];
            conv.bgra_to_nv12(8, 8, &bgra, &mut nv12).unwrap();
            let mut back = vec![0u8; 8 * 8 * 4];
            conv.nv12_to_bgra(8, 8, &nv12, &mut back).unwrap();
            for px in back.chunks(4) {
                for &ch in &px[..3] {
                    assert!((ch as i32 - expect).abs() <= 2);
                }
            }
        }
    }

    #[test]
    fn studio_range_compresses_swing() {
        let conv = Converter::new(ColorMatrix::Bt601, ColorRange::Studio);
        let white = solid_bgra(8, 8, 255, 255, 255);
        let mut nv12 = vec![0u8; PixelFormat::Nv12.buffer_size(8, 8)];
        conv.bgra_to_nv12(8, 8, &white, &mut nv12).unwrap();
        // Studio white is 235, not 255.
        assert!((nv12[0] as i32 - 235).abs() <= 1);

        let black = solid_bgra(8, 8, 0, 0, 0);
        conv.bgra_to_nv12(8, 8, &black, &mut nv12).unwrap();
        assert!((nv12[0] as i32 - 16).abs() <= 1);
    }

    #[test]
    fn matrices_disagree_on_saturated_colors() {
        let red = solid_bgra(8, 8, 0, 0, 255);
        let mut nv601 = vec![0u8; PixelFormat::Nv12.buffer_size(8, 8)];
        let mut nv709 = vec![0u8; PixelFormat::Nv12.buffer_size(8, 8)];
        Converter::new(ColorMatrix::Bt601, ColorRange::Full)
            .bgra_to_nv12(8, 8, &red, &mut nv601)
            .unwrap();
        Converter::new(ColorMatrix::Bt709, ColorRange::Full)
            .bgra_to_nv12(8, 8, &red, &mut nv709)
            .unwrap();
        // Red luma: 0.299*255 vs 0.2126*255.
        assert!(nv601[0] > nv709[0]);
    }

    #[test]
    fn odd_dimensions_rejected() {
        let conv = Converter::default();
        let mut out = vec![0u8; 1024];
        assert!(matches!(
            conv.nv12_to_bgra(7, 8, &[0u8; 1024], &mut out),
            Err(Error::OddDimensions { .. })
        ));
    }

    #[test]
    fn short_buffers_rejected() {
        let conv = Converter::default();
        let mut out = vec![0u8; 8];
        assert!(conv.nv12_to_bgra(16, 16, &[0u8; 8], &mut out).is_err());
    }
}
