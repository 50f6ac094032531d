//! Vulkan Video hardware backend.
//!
//! Drives the codec session protocol through `VK_KHR_video_queue` and the
//! codec-specific decode/encode extensions. H.264 is the supported codec;
//! H.265 and AV1 capability is reported from the driver's extension list
//! but session creation for them is rejected.
//!
//! # Requirements
//!
//! - Vulkan 1.3+
//! - `VK_KHR_video_queue` plus `VK_KHR_video_decode_queue` /
//!   `VK_KHR_video_encode_queue` for the direction in use
//! - `VK_KHR_external_memory_fd` for shared texture handles
//!
//! Known working drivers: RADV and ANV (Mesa 23.1+), NVIDIA 525+.

mod context;
mod decoder;
mod encoder;
mod h264;
mod resources;
mod session;

pub use context::VulkanDevice;
pub use decoder::VulkanDecoder;
pub use encoder::VulkanEncoder;

use crate::device::AdapterInfo;
use crate::error::{Error, Result};
use ash::vk;

/// Vulkan Video extension names.
pub mod extensions {
    /// Core video queue extension.
    pub const VIDEO_QUEUE: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_queue\0") };

    /// Video decode queue extension.
    pub const VIDEO_DECODE_QUEUE: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_decode_queue\0") };

    /// Video encode queue extension.
    pub const VIDEO_ENCODE_QUEUE: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_encode_queue\0") };

    /// H.264 decode extension.
    pub const VIDEO_DECODE_H264: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_decode_h264\0") };

    /// H.265 decode extension.
    pub const VIDEO_DECODE_H265: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_decode_h265\0") };

    /// AV1 decode extension.
    pub const VIDEO_DECODE_AV1: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_decode_av1\0") };

    /// H.264 encode extension.
    pub const VIDEO_ENCODE_H264: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_encode_h264\0") };

    /// H.265 encode extension.
    pub const VIDEO_ENCODE_H265: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_video_encode_h265\0") };

    /// External memory extension.
    pub const EXTERNAL_MEMORY: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_external_memory\0") };

    /// External memory FD extension.
    pub const EXTERNAL_MEMORY_FD: &std::ffi::CStr =
        unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_KHR_external_memory_fd\0") };

    /// DMA-BUF external memory extension.
    pub const EXTERNAL_MEMORY_DMABUF: &std::ffi::CStr = unsafe {
        std::ffi::CStr::from_bytes_with_nul_unchecked(b"VK_EXT_external_memory_dma_buf\0")
    };
}

/// Map a Vulkan result to the crate error, tagged with the failing call.
pub(crate) fn vk_err(call: &str, result: vk::Result) -> Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost(format!("{call}: device lost")),
        vk::Result::ERROR_EXTENSION_NOT_PRESENT
        | vk::Result::ERROR_FEATURE_NOT_PRESENT
        | vk::Result::ERROR_FORMAT_NOT_SUPPORTED
        | vk::Result::ERROR_VIDEO_PROFILE_OPERATION_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_PROFILE_FORMAT_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR
        | vk::Result::ERROR_VIDEO_STD_VERSION_NOT_SUPPORTED_KHR => {
            Error::Unsupported(format!("{call}: {result:?}"))
        }
        other => Error::SessionFailed(format!("{call}: {other:?}")),
    }
}

/// Check a raw Vulkan result from a loaded function pointer.
pub(crate) fn check(call: &str, result: vk::Result) -> Result<()> {
    if result == vk::Result::SUCCESS {
        Ok(())
    } else {
        Err(vk_err(call, result))
    }
}

/// Whether a Vulkan 1.3 loader and at least one physical device with a
/// video queue can be reached.
pub fn driver_available() -> bool {
    context::probe_driver().is_ok()
}

/// Enumerate adapters with video queue support.
pub fn enumerate_adapters() -> Result<Vec<AdapterInfo>> {
    context::enumerate()
}
