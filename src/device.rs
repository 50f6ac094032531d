//! Adapter identity and device binding.
//!
//! A session either adopts a device the caller already owns (sharing its
//! context refcount) or creates one by adapter identity. Both paths end
//! with a multithread-protected context, since codec components and the
//! caller's render thread touch the same device.

use crate::backend::{soft, BackendKind};
use crate::error::{Error, Result};
use std::sync::Arc;

/// 64-bit adapter identity (LUID-style: high part in the upper 32 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(pub u64);

impl AdapterId {
    /// Compose from high/low parts.
    pub fn from_parts(high: i32, low: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }
}

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// GPU vendor, by PCI id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterVendor {
    /// NVIDIA (0x10DE).
    Nvidia,
    /// AMD (0x1002).
    Amd,
    /// Intel (0x8086).
    Intel,
    /// The built-in software device.
    Software,
}

impl AdapterVendor {
    /// PCI vendor id, if the vendor has one.
    pub fn pci_id(&self) -> Option<u32> {
        match self {
            AdapterVendor::Nvidia => Some(0x10DE),
            AdapterVendor::Amd => Some(0x1002),
            AdapterVendor::Intel => Some(0x8086),
            AdapterVendor::Software => None,
        }
    }

    /// Map a PCI vendor id back to a vendor.
    pub fn from_pci_id(id: u32) -> Option<Self> {
        match id {
            0x10DE => Some(AdapterVendor::Nvidia),
            0x1002 => Some(AdapterVendor::Amd),
            0x8086 => Some(AdapterVendor::Intel),
            _ => None,
        }
    }
}

/// One enumerated adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter identity.
    pub id: AdapterId,
    /// Vendor.
    pub vendor: AdapterVendor,
    /// Human-readable description.
    pub description: String,
}

#[derive(Debug)]
pub(crate) enum DeviceInner {
    Soft(soft::SoftDevice),
    #[cfg(feature = "vulkan-video")]
    Vulkan(crate::backend::vulkan::VulkanDevice),
}

/// A live, multithread-protected device context.
///
/// Cheaply clonable; clones share the underlying context. Dropping the
/// last clone releases the device, after any session using it has closed.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub(crate) inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    /// Bind a device for `kind`.
    ///
    /// With `existing`, the caller's device is adopted (refcount clone)
    /// after checking it belongs to the same backend; `adapter` is then
    /// ignored. Otherwise adapters are enumerated and the one matching
    /// `adapter` (or the first, when `None`) is used to create a fresh
    /// context. Failure at any step is fatal to construction; there is
    /// no retry path here.
    pub fn bind(
        kind: BackendKind,
        adapter: Option<AdapterId>,
        existing: Option<&DeviceHandle>,
    ) -> Result<DeviceHandle> {
        if let Some(handle) = existing {
            if handle.kind() != kind {
                return Err(Error::InvalidParameter(format!(
                    "existing device belongs to backend {:?}, requested {:?}",
                    handle.kind(),
                    kind
                )));
            }
            return Ok(handle.clone());
        }

        let inner = match kind {
            BackendKind::Software => DeviceInner::Soft(soft::SoftDevice::create(adapter)?),
            #[cfg(feature = "vulkan-video")]
            BackendKind::Vulkan => {
                DeviceInner::Vulkan(crate::backend::vulkan::VulkanDevice::create(adapter)?)
            }
        };
        let handle = DeviceHandle {
            inner: Arc::new(inner),
        };
        tracing::debug!(adapter = %handle.adapter().id, kind = ?kind, "device bound");
        Ok(handle)
    }

    /// Backend this device belongs to.
    pub fn kind(&self) -> BackendKind {
        match &*self.inner {
            DeviceInner::Soft(_) => BackendKind::Software,
            #[cfg(feature = "vulkan-video")]
            DeviceInner::Vulkan(_) => BackendKind::Vulkan,
        }
    }

    /// The adapter this device was created on.
    pub fn adapter(&self) -> &AdapterInfo {
        match &*self.inner {
            DeviceInner::Soft(d) => d.adapter(),
            #[cfg(feature = "vulkan-video")]
            DeviceInner::Vulkan(d) => d.adapter(),
        }
    }

    /// Whether concurrent component/caller access is serialized by the
    /// context. Always true for a successfully bound device.
    pub fn multithread_protected(&self) -> bool {
        match &*self.inner {
            DeviceInner::Soft(d) => d.multithread_protected(),
            #[cfg(feature = "vulkan-video")]
            DeviceInner::Vulkan(_) => true,
        }
    }

    /// Map an exported shared texture handle into caller-visible bytes.
    ///
    /// The handle must come from a session on a compatible device.
    pub fn open_shared_handle(
        &self,
        handle: std::os::fd::BorrowedFd<'_>,
        size: usize,
    ) -> Result<Vec<u8>> {
        match &*self.inner {
            DeviceInner::Soft(d) => d.open_shared(handle, size),
            #[cfg(feature = "vulkan-video")]
            DeviceInner::Vulkan(d) => d.open_shared(handle, size),
        }
    }

    /// Enumerate adapters visible to `kind`, optionally filtered by vendor.
    pub fn enumerate_adapters(
        kind: BackendKind,
        vendor: Option<AdapterVendor>,
    ) -> Result<Vec<AdapterInfo>> {
        let all = match kind {
            BackendKind::Software => soft::enumerate_adapters(),
            #[cfg(feature = "vulkan-video")]
            BackendKind::Vulkan => crate::backend::vulkan::enumerate_adapters()?,
        };
        Ok(match vendor {
            Some(v) => all.into_iter().filter(|a| a.vendor == v).collect(),
            None => all,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_id_parts() {
        let id = AdapterId::from_parts(1, 2);
        assert_eq!(id.0, (1u64 << 32) | 2);
        let neg = AdapterId::from_parts(-1, 0);
        assert_eq!(neg.0 >> 32, 0xFFFF_FFFF);
    }

    #[test]
    fn vendor_pci_roundtrip() {
        for v in [AdapterVendor::Nvidia, AdapterVendor::Amd, AdapterVendor::Intel] {
            assert_eq!(AdapterVendor::from_pci_id(v.pci_id().unwrap()), Some(v));
        }
        assert_eq!(AdapterVendor::from_pci_id(0xBEEF), None);
    }

    #[test]
    fn bind_and_adopt() {
        let dev = DeviceHandle::bind(BackendKind::Software, None, None).unwrap();
        assert!(dev.multithread_protected());
        assert_eq!(dev.kind(), BackendKind::Software);

        let adopted = DeviceHandle::bind(BackendKind::Software, None, Some(&dev)).unwrap();
        assert!(Arc::ptr_eq(&dev.inner, &adopted.inner));
    }

    #[test]
    fn bind_unknown_adapter_fails() {
        let err = DeviceHandle::bind(
            BackendKind::Software,
            Some(AdapterId(0xDEAD_BEEF)),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AdapterNotFound(_)));
    }

    #[test]
    fn enumerate_software_adapters() {
        let adapters =
            DeviceHandle::enumerate_adapters(BackendKind::Software, None).unwrap();
        assert!(!adapters.is_empty());
        assert!(adapters.iter().all(|a| a.vendor == AdapterVendor::Software));
    }
}
