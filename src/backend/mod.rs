//! Vendor backend dispatch.
//!
//! Each backend is one variant of the component enums below; calls are
//! forwarded with a match. Adding a backend means adding a variant and
//! its arms, and every backend instance owns its device and allocator
//! state outright.

pub mod soft;

#[cfg(feature = "vulkan-video")]
pub mod vulkan;

use crate::decode::DecodedOutput;
use crate::device::DeviceHandle;
use crate::encode::EncodedPacket;
use crate::error::Result;
use crate::format::{CodecDescriptor, QpRange};
use crate::retry::SubmitStatus;
use crate::surface::Surface;
use std::os::fd::OwnedFd;

/// Available backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Deterministic software device, always available.
    Software,
    /// Vulkan Video hardware backend.
    #[cfg(feature = "vulkan-video")]
    Vulkan,
}

/// Result of parameter negotiation with a component.
///
/// The component may adjust the descriptor (alignment, profile caps); an
/// adjustment that would break the caller contract fails creation
/// instead. `suggested_surfaces` already includes the backend's safety
/// margin and sizes the surface pool verbatim.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Descriptor after backend adjustment.
    pub descriptor: CodecDescriptor,
    /// Surface pool capacity to allocate.
    pub suggested_surfaces: usize,
    /// Output texture ring depth (decode only; encode sets the minimum).
    pub ring_depth: usize,
}

/// A mid-stream mutable property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// Target bitrate in kilobits per second.
    Bitrate(u32),
    /// Target framerate in frames per second.
    Framerate(u32),
    /// QP bounds.
    Qp(QpRange),
}

impl Property {
    /// Label for metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Property::Bitrate(_) => "bitrate",
            Property::Framerate(_) => "framerate",
            Property::Qp(_) => "qp",
        }
    }
}

/// Outcome of an in-place property mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOutcome {
    /// The component applied the change without interruption.
    Applied,
    /// The component cannot mutate this property live; the session must
    /// run the snapshot-reset path.
    NeedsReset,
}

/// Deterministic fault injection for exercising retry and stall paths.
///
/// Only honored by the software backend; hardware backends ignore it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInjection {
    /// Report `Busy` on every submit, forever.
    pub always_busy: bool,
    /// Report `Busy` this many times before accepting each frame.
    pub busy_per_frame: u32,
}

/// Encoder component, one variant per backend.
#[derive(Debug)]
pub enum EncodeComponent {
    /// Software encoder.
    Soft(soft::SoftEncoder),
    /// Vulkan Video encoder.
    #[cfg(feature = "vulkan-video")]
    Vulkan(vulkan::VulkanEncoder),
}

impl EncodeComponent {
    /// Create and negotiate an encoder component on `device`.
    pub fn create(
        device: &DeviceHandle,
        desc: &CodecDescriptor,
        fault: FaultInjection,
    ) -> Result<(Self, Negotiated)> {
        match device.kind() {
            BackendKind::Software => {
                let (enc, neg) = soft::SoftEncoder::create(device, desc, fault)?;
                Ok((EncodeComponent::Soft(enc), neg))
            }
            #[cfg(feature = "vulkan-video")]
            BackendKind::Vulkan => {
                let (enc, neg) = vulkan::VulkanEncoder::create(device, desc)?;
                Ok((EncodeComponent::Vulkan(enc), neg))
            }
        }
    }

    /// Submit one input frame bound to `surface`.
    pub fn submit(
        &mut self,
        surface: &Surface,
        frame: &[u8],
        pts: i64,
        force_idr: bool,
    ) -> Result<SubmitStatus> {
        match self {
            EncodeComponent::Soft(e) => e.submit(surface, frame, pts, force_idr),
            #[cfg(feature = "vulkan-video")]
            EncodeComponent::Vulkan(e) => e.submit(surface, frame, pts, force_idr),
        }
    }

    /// Take the packet produced by the last accepted submit, if any.
    pub fn poll_packet(&mut self) -> Result<Option<EncodedPacket>> {
        match self {
            EncodeComponent::Soft(e) => e.poll_packet(),
            #[cfg(feature = "vulkan-video")]
            EncodeComponent::Vulkan(e) => e.poll_packet(),
        }
    }

    /// Whether the last submission's device work has completed.
    pub fn sync_done(&mut self) -> Result<bool> {
        match self {
            EncodeComponent::Soft(e) => e.sync_done(),
            #[cfg(feature = "vulkan-video")]
            EncodeComponent::Vulkan(e) => e.sync_done(),
        }
    }

    /// Attempt an in-place property mutation.
    pub fn try_set_property(&mut self, property: Property) -> Result<PropertyOutcome> {
        match self {
            EncodeComponent::Soft(e) => e.try_set_property(property),
            #[cfg(feature = "vulkan-video")]
            EncodeComponent::Vulkan(e) => e.try_set_property(property),
        }
    }

    /// Reinitialize the component from a full descriptor snapshot.
    /// Surface allocations owned by the session are untouched.
    pub fn reset(&mut self, desc: &CodecDescriptor) -> Result<()> {
        match self {
            EncodeComponent::Soft(e) => e.reset(desc),
            #[cfg(feature = "vulkan-video")]
            EncodeComponent::Vulkan(e) => e.reset(desc),
        }
    }

    /// Release component resources. Idempotent.
    pub fn close(&mut self) {
        match self {
            EncodeComponent::Soft(e) => e.close(),
            #[cfg(feature = "vulkan-video")]
            EncodeComponent::Vulkan(e) => e.close(),
        }
    }
}

/// Decoder component, one variant per backend.
#[derive(Debug)]
pub enum DecodeComponent {
    /// Software decoder.
    Soft(soft::SoftDecoder),
    /// Vulkan Video decoder.
    #[cfg(feature = "vulkan-video")]
    Vulkan(vulkan::VulkanDecoder),
}

impl DecodeComponent {
    /// Create and negotiate a decoder component on `device`.
    pub fn create(
        device: &DeviceHandle,
        desc: &CodecDescriptor,
        fault: FaultInjection,
    ) -> Result<(Self, Negotiated)> {
        match device.kind() {
            BackendKind::Software => {
                let (dec, neg) = soft::SoftDecoder::create(device, desc, fault)?;
                Ok((DecodeComponent::Soft(dec), neg))
            }
            #[cfg(feature = "vulkan-video")]
            BackendKind::Vulkan => {
                let (dec, neg) = vulkan::VulkanDecoder::create(device, desc)?;
                Ok((DecodeComponent::Vulkan(dec), neg))
            }
        }
    }

    /// Submit one compressed packet.
    pub fn submit(&mut self, packet: &[u8], surface: &Surface) -> Result<SubmitStatus> {
        match self {
            DecodeComponent::Soft(d) => d.submit(packet, surface),
            #[cfg(feature = "vulkan-video")]
            DecodeComponent::Vulkan(d) => d.submit(packet, surface),
        }
    }

    /// Take the frame produced by the last accepted submit, if any.
    /// The converted texture is written into the output ring before this
    /// returns.
    pub fn poll_frame(&mut self) -> Result<Option<DecodedOutput>> {
        match self {
            DecodeComponent::Soft(d) => d.poll_frame(),
            #[cfg(feature = "vulkan-video")]
            DecodeComponent::Vulkan(d) => d.poll_frame(),
        }
    }

    /// Whether the last submission's device work has completed.
    pub fn sync_done(&mut self) -> Result<bool> {
        match self {
            DecodeComponent::Soft(d) => d.sync_done(),
            #[cfg(feature = "vulkan-video")]
            DecodeComponent::Vulkan(d) => d.sync_done(),
        }
    }

    /// Bytes of the active ring texture (CPU-visible backends only).
    pub fn current_texture(&self) -> Result<&[u8]> {
        match self {
            DecodeComponent::Soft(d) => d.current_texture(),
            #[cfg(feature = "vulkan-video")]
            DecodeComponent::Vulkan(d) => d.current_texture(),
        }
    }

    /// Export an OS handle to the active ring texture.
    pub fn export_shared_handle(&self) -> Result<OwnedFd> {
        match self {
            DecodeComponent::Soft(d) => d.export_shared_handle(),
            #[cfg(feature = "vulkan-video")]
            DecodeComponent::Vulkan(d) => d.export_shared_handle(),
        }
    }

    /// Release component resources. Idempotent.
    pub fn close(&mut self) {
        match self {
            DecodeComponent::Soft(d) => d.close(),
            #[cfg(feature = "vulkan-video")]
            DecodeComponent::Vulkan(d) => d.close(),
        }
    }
}
