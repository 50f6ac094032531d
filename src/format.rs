//! Codec descriptors, pixel formats, and construction-time validation.

use crate::error::{Error, Result};

/// GOP length sentinel meaning "no periodic keyframes".
///
/// Backends translate this to their own infinite-GOP encoding.
pub const MAX_GOP: u32 = 0xFFFF;

/// Maximum QP value for H.264/H.265.
pub const MAX_QP: u8 = 51;

/// Video codec types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    Hevc,
    /// AV1
    Av1,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::H264 => write!(f, "H.264"),
            Codec::Hevc => write!(f, "H.265"),
            Codec::Av1 => write!(f, "AV1"),
        }
    }
}

/// Pixel format of device surfaces and conversion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Semi-planar YUV 4:2:0 (Y plane, then interleaved UV plane).
    Nv12,
    /// 10-bit NV12 (Y and UV in 16-bit containers).
    P010,
    /// Packed BGRA, 4 bytes per pixel.
    Bgra,
    /// Packed RGBA, 4 bytes per pixel.
    Rgba,
}

impl PixelFormat {
    /// Returns true if this is a subsampled YUV format.
    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::P010)
    }

    /// Calculate total buffer size for given dimensions.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Nv12 => w * h * 3 / 2,
            PixelFormat::P010 => w * h * 3,
            PixelFormat::Bgra | PixelFormat::Rgba => w * h * 4,
        }
    }
}

/// Color matrix for YUV ↔ RGB conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMatrix {
    /// BT.601 (SD video).
    #[default]
    Bt601,
    /// BT.709 (HD video).
    Bt709,
}

/// Quantization range of YUV samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    /// Studio swing: Y in 16..=235, chroma in 16..=240.
    #[default]
    Studio,
    /// Full swing: all components in 0..=255.
    Full,
}

/// Session direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Compressed in, surfaces out.
    Decode,
    /// Surfaces in, compressed out.
    Encode,
}

/// QP bounds for rate control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpRange {
    /// Minimum quantization parameter.
    pub min: u8,
    /// Maximum quantization parameter.
    pub max: u8,
}

impl QpRange {
    /// Validate ordering and codec bounds.
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max || self.max > MAX_QP {
            return Err(Error::InvalidParameter(format!(
                "qp range {}..={} outside 0..={} or inverted",
                self.min, self.max, MAX_QP
            )));
        }
        Ok(())
    }
}

/// Complete description of a codec session's static and dynamic parameters.
///
/// Captured at construction, snapshotted for reconfiguration resets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    /// Session direction.
    pub direction: Direction,
    /// Compressed format.
    pub codec: Codec,
    /// Device surface format.
    pub surface_format: PixelFormat,
    /// Frame width in pixels. Must be even.
    pub width: u32,
    /// Frame height in pixels. Must be even.
    pub height: u32,
    /// Target bitrate in kilobits per second (encode only).
    pub bitrate_kbps: u32,
    /// Target framerate in frames per second.
    pub framerate: u32,
    /// Keyframe interval; [`MAX_GOP`] for no periodic keyframes.
    pub gop: u32,
    /// Optional QP bounds (encode only).
    pub qp: Option<QpRange>,
    /// Color matrix for surface conversion.
    pub matrix: ColorMatrix,
    /// Quantization range of the YUV samples.
    pub range: ColorRange,
}

impl CodecDescriptor {
    /// Validate the descriptor before any device resource is touched.
    ///
    /// Rejecting here keeps a half-configured component from ever
    /// existing; construction either returns a live session or nothing.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidParameter(
                "width and height must be non-zero".into(),
            ));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(Error::OddDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.framerate == 0 {
            return Err(Error::InvalidParameter("framerate must be non-zero".into()));
        }
        if self.gop == 0 {
            return Err(Error::InvalidParameter("gop must be at least 1".into()));
        }
        if self.direction == Direction::Encode {
            if self.bitrate_kbps == 0 {
                return Err(Error::InvalidParameter("bitrate must be non-zero".into()));
            }
            if let Some(qp) = &self.qp {
                qp.validate()?;
            }
        }
        Ok(())
    }

    /// Whether this configuration guarantees one output per input.
    ///
    /// Holds when frame reordering is disabled (no B-frames, which the
    /// low-latency presets pin) regardless of GOP length.
    pub fn is_low_latency(&self) -> bool {
        // B-frames are never enabled; every session is one-in one-out.
        true
    }

    /// Byte size of one uncompressed frame in the surface format.
    pub fn frame_size(&self) -> usize {
        self.surface_format.buffer_size(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_desc() -> CodecDescriptor {
        CodecDescriptor {
            direction: Direction::Encode,
            codec: Codec::H264,
            surface_format: PixelFormat::Nv12,
            width: 1280,
            height: 720,
            bitrate_kbps: 2000,
            framerate: 30,
            gop: MAX_GOP,
            qp: None,
            matrix: ColorMatrix::default(),
            range: ColorRange::default(),
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        assert!(encode_desc().validate().is_ok());
    }

    #[test]
    fn odd_dimensions_rejected() {
        let mut d = encode_desc();
        d.width = 1281;
        assert!(matches!(
            d.validate(),
            Err(Error::OddDimensions { width: 1281, .. })
        ));

        let mut d = encode_desc();
        d.height = 721;
        assert!(d.validate().is_err());
    }

    #[test]
    fn zero_rates_rejected() {
        let mut d = encode_desc();
        d.framerate = 0;
        assert!(d.validate().is_err());

        let mut d = encode_desc();
        d.bitrate_kbps = 0;
        assert!(d.validate().is_err());

        let mut d = encode_desc();
        d.gop = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn qp_range_bounds() {
        assert!(QpRange { min: 10, max: 40 }.validate().is_ok());
        assert!(QpRange { min: 0, max: 51 }.validate().is_ok());
        assert!(QpRange { min: 40, max: 10 }.validate().is_err());
        assert!(QpRange { min: 0, max: 52 }.validate().is_err());
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Nv12.buffer_size(1280, 720), 1280 * 720 * 3 / 2);
        assert_eq!(PixelFormat::Bgra.buffer_size(64, 64), 64 * 64 * 4);
        assert_eq!(PixelFormat::P010.buffer_size(64, 64), 64 * 64 * 3);
    }
}
