//! # hwvideo
//!
//! Hardware-accelerated video encode/decode sessions with texture-based
//! I/O and synchronous callback delivery.
//!
//! A session binds a device (adopting the caller's or creating one by
//! adapter identity), negotiates parameters with a vendor codec
//! component, and then moves frames one at a time: submit, bounded
//! busy-retry, bounded completion sync, one artifact per input delivered
//! to the caller's callback before the call returns.
//!
//! ## Backends
//!
//! - Software: deterministic CPU device, always available. Textures are
//!   memfd-backed so shared handles are real file descriptors.
//! - Vulkan Video (feature `vulkan-video`): ash-based hardware backend.
//!
//! ## Quick start
//!
//! ```rust
//! use hwvideo::prelude::*;
//!
//! # fn main() -> hwvideo::Result<()> {
//! let mut encoder = Encoder::new(EncoderConfig::new(Codec::H264, 1280, 720))?;
//! let frame = vec![0u8; 1280 * 720 * 3 / 2]; // NV12
//! encoder.encode(&frame, 0, |packet| {
//!     assert!(packet.keyframe);
//! })?;
//! encoder.set_bitrate(4000)?;
//! encoder.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod convert;
pub mod decode;
pub mod device;
pub mod encode;
pub mod error;
pub mod format;
pub mod observability;
pub mod probe;
pub mod retry;
pub mod ring;
pub mod session;
pub mod surface;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendKind, FaultInjection};
    pub use crate::decode::{DecodedFrame, Decoder, DecoderConfig};
    pub use crate::device::{AdapterId, AdapterVendor, DeviceHandle};
    pub use crate::encode::{EncodedPacket, Encoder, EncoderConfig};
    pub use crate::error::{Error, Result};
    pub use crate::format::{Codec, ColorMatrix, ColorRange, PixelFormat, QpRange, MAX_GOP};
    pub use crate::session::SessionState;
}

pub use decode::{DecodedFrame, Decoder, DecoderConfig};
pub use encode::{EncodedPacket, Encoder, EncoderConfig};
pub use error::{Error, Result};
pub use format::Codec;
