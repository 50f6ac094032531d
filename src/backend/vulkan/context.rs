//! Vulkan instance, adapter selection, and logical device.
//!
//! One [`VulkanDevice`] per session family: it owns the instance, the
//! logical device with video queues, and the memory type tables the
//! codec components allocate from.

use super::{extensions, vk_err};
use crate::device::{AdapterId, AdapterInfo, AdapterVendor};
use crate::error::{Error, Result};
use crate::format::{Codec, Direction};

use ash::vk;
use std::ffi::CStr;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

/// A live Vulkan device with video queues.
pub struct VulkanDevice {
    /// Keeps the loader alive for the instance's lifetime.
    entry: ash::Entry,
    instance: ash::Instance,
    physical: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    adapter: AdapterInfo,
    decode_queue_family: Option<u32>,
    encode_queue_family: Option<u32>,
    decode_queue: Option<vk::Queue>,
    encode_queue: Option<vk::Queue>,
    /// Device extensions actually enabled.
    enabled: Vec<&'static CStr>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("adapter", &self.adapter)
            .field("decode_queue_family", &self.decode_queue_family)
            .field("encode_queue_family", &self.encode_queue_family)
            .finish()
    }
}

/// Instance bootstrap shared by probing, enumeration, and creation.
fn create_instance() -> Result<(ash::Entry, ash::Instance)> {
    let entry = unsafe {
        ash::Entry::load().map_err(|e| Error::Unsupported(format!("vulkan loader: {e}")))?
    };

    let version = unsafe {
        entry
            .try_enumerate_instance_version()
            .map_err(|r| vk_err("vkEnumerateInstanceVersion", r))?
            .unwrap_or(vk::API_VERSION_1_0)
    };
    if vk::api_version_major(version) == 1 && vk::api_version_minor(version) < 3 {
        return Err(Error::Unsupported(format!(
            "vulkan 1.3+ required, loader reports {}.{}",
            vk::api_version_major(version),
            vk::api_version_minor(version)
        )));
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"hwvideo")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

    let instance = unsafe {
        entry
            .create_instance(&create_info, None)
            .map_err(|r| vk_err("vkCreateInstance", r))?
    };
    Ok((entry, instance))
}

fn adapter_info(instance: &ash::Instance, device: vk::PhysicalDevice) -> AdapterInfo {
    let props = unsafe { instance.get_physical_device_properties(device) };
    let vendor = if props.device_type == vk::PhysicalDeviceType::CPU {
        AdapterVendor::Software
    } else {
        AdapterVendor::from_pci_id(props.vendor_id).unwrap_or(AdapterVendor::Software)
    };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
    AdapterInfo {
        id: AdapterId::from_parts(props.vendor_id as i32, props.device_id),
        vendor,
        description: name.to_string_lossy().into_owned(),
    }
}

fn has_video_queue(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families.iter().any(|qf| {
        qf.queue_flags
            .intersects(vk::QueueFlags::VIDEO_DECODE_KHR | vk::QueueFlags::VIDEO_ENCODE_KHR)
    })
}

pub(super) fn probe_driver() -> Result<()> {
    let (_entry, instance) = create_instance()?;
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|r| vk_err("vkEnumeratePhysicalDevices", r))?
    };
    let found = devices.iter().any(|&d| has_video_queue(&instance, d));
    unsafe { instance.destroy_instance(None) };
    if found {
        Ok(())
    } else {
        Err(Error::Unsupported("no vulkan device with video queues".into()))
    }
}

pub(super) fn enumerate() -> Result<Vec<AdapterInfo>> {
    let (_entry, instance) = create_instance()?;
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|r| vk_err("vkEnumeratePhysicalDevices", r))?
    };
    let adapters = devices
        .iter()
        .filter(|&&d| has_video_queue(&instance, d))
        .map(|&d| adapter_info(&instance, d))
        .collect();
    unsafe { instance.destroy_instance(None) };
    Ok(adapters)
}

impl VulkanDevice {
    /// Create a device on `adapter`, or on the best-scored video-capable
    /// adapter when `None`.
    pub fn create(adapter: Option<AdapterId>) -> Result<Self> {
        let (entry, instance) = create_instance()?;
        match Self::create_on(entry, &instance, adapter) {
            Ok(dev) => Ok(dev),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn create_on(
        entry: ash::Entry,
        instance: &ash::Instance,
        adapter: Option<AdapterId>,
    ) -> Result<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|r| vk_err("vkEnumeratePhysicalDevices", r))?
        };

        let physical = match adapter {
            Some(wanted) => devices
                .iter()
                .copied()
                .find(|&d| adapter_info(instance, d).id == wanted)
                .ok_or(Error::AdapterNotFound(wanted.0))?,
            None => Self::select_physical(instance, &devices)?,
        };

        let info = adapter_info(instance, physical);
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };

        let decode_queue_family = families
            .iter()
            .position(|qf| qf.queue_flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR))
            .map(|i| i as u32);
        let encode_queue_family = families
            .iter()
            .position(|qf| qf.queue_flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR))
            .map(|i| i as u32);

        if decode_queue_family.is_none() && encode_queue_family.is_none() {
            return Err(Error::Unsupported(format!(
                "adapter {} has no video queues",
                info.id
            )));
        }

        let queue_priority = [1.0f32];
        let mut queue_create_infos = Vec::new();
        if let Some(family) = decode_queue_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priority),
            );
        }
        if let Some(family) = encode_queue_family {
            if Some(family) != decode_queue_family {
                queue_create_infos.push(
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(&queue_priority),
                );
            }
        }

        let available = unsafe {
            instance
                .enumerate_device_extension_properties(physical)
                .unwrap_or_default()
        };
        let available: Vec<&CStr> = available
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();

        let wanted = [
            extensions::VIDEO_QUEUE,
            extensions::VIDEO_DECODE_QUEUE,
            extensions::VIDEO_ENCODE_QUEUE,
            extensions::VIDEO_DECODE_H264,
            extensions::VIDEO_DECODE_H265,
            extensions::VIDEO_DECODE_AV1,
            extensions::VIDEO_ENCODE_H264,
            extensions::VIDEO_ENCODE_H265,
            extensions::EXTERNAL_MEMORY,
            extensions::EXTERNAL_MEMORY_FD,
            extensions::EXTERNAL_MEMORY_DMABUF,
        ];
        let enabled: Vec<&'static CStr> = wanted
            .into_iter()
            .filter(|ext| available.contains(ext))
            .collect();
        let enabled_ptrs: Vec<*const i8> = enabled.iter().map(|e| e.as_ptr()).collect();

        let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_13);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical, &device_create_info, None)
                .map_err(|r| vk_err("vkCreateDevice", r))?
        };
        let device = Arc::new(device);

        let decode_queue =
            decode_queue_family.map(|family| unsafe { device.get_device_queue(family, 0) });
        let encode_queue = encode_queue_family.map(|family| {
            if encode_queue_family == decode_queue_family {
                decode_queue.unwrap()
            } else {
                unsafe { device.get_device_queue(family, 0) }
            }
        });

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical) };

        tracing::info!(
            adapter = %info.id,
            description = %info.description,
            decode = decode_queue_family.is_some(),
            encode = encode_queue_family.is_some(),
            "vulkan device created"
        );

        Ok(Self {
            entry,
            instance: instance.clone(),
            physical,
            device,
            adapter: info,
            decode_queue_family,
            encode_queue_family,
            decode_queue,
            encode_queue,
            enabled,
            memory_properties,
        })
    }

    /// Prefer discrete GPUs; every video queue direction adds weight.
    fn select_physical(
        instance: &ash::Instance,
        devices: &[vk::PhysicalDevice],
    ) -> Result<vk::PhysicalDevice> {
        let mut best = None;
        let mut best_score = 0;
        for &device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
                _ => 1,
            };
            let mut has_video = false;
            if families
                .iter()
                .any(|qf| qf.queue_flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR))
            {
                score += 500;
                has_video = true;
            }
            if families
                .iter()
                .any(|qf| qf.queue_flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR))
            {
                score += 500;
                has_video = true;
            }
            if has_video && score > best_score {
                best_score = score;
                best = Some(device);
            }
        }
        best.ok_or_else(|| Error::Unsupported("no vulkan device with video queues".into()))
    }

    /// Whether the driver advertises `codec` in `direction`.
    pub fn supports(&self, direction: Direction, codec: Codec) -> bool {
        let ext = match (direction, codec) {
            (Direction::Decode, Codec::H264) => extensions::VIDEO_DECODE_H264,
            (Direction::Decode, Codec::Hevc) => extensions::VIDEO_DECODE_H265,
            (Direction::Decode, Codec::Av1) => extensions::VIDEO_DECODE_AV1,
            (Direction::Encode, Codec::H264) => extensions::VIDEO_ENCODE_H264,
            (Direction::Encode, Codec::Hevc) => extensions::VIDEO_ENCODE_H265,
            (Direction::Encode, Codec::Av1) => return false,
        };
        let queue = match direction {
            Direction::Decode => self.decode_queue_family.is_some(),
            Direction::Encode => self.encode_queue_family.is_some(),
        };
        queue && self.enabled.contains(&ext)
    }

    /// The adapter this device was created on.
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// Map a shared texture handle by importing it as external memory.
    ///
    /// The fd is duplicated first; the caller keeps ownership of theirs.
    /// Returns a CPU copy of the mapped contents.
    pub fn open_shared(&self, handle: BorrowedFd<'_>, size: usize) -> Result<Vec<u8>> {
        use std::os::fd::IntoRawFd;

        if !self.enabled.contains(&extensions::EXTERNAL_MEMORY_FD) {
            return Err(Error::Unsupported(
                "VK_KHR_external_memory_fd not available".into(),
            ));
        }

        let memory_type = self
            .find_memory_type(
                u32::MAX,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or_else(|| Error::Unsupported("no host-visible memory type".into()))?;

        let dup = rustix::io::fcntl_dupfd_cloexec(handle, 0)?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .fd(dup.into_raw_fd());
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size as u64)
            .memory_type_index(memory_type)
            .push_next(&mut import_info);

        // Vulkan owns the duplicated fd from here, success or failure.
        let memory = unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(|r| vk_err("vkAllocateMemory(import)", r))?
        };

        let mut out = vec![0u8; size];
        let result = unsafe {
            self.device
                .map_memory(memory, 0, size as u64, vk::MemoryMapFlags::empty())
        };
        match result {
            Ok(ptr) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), size);
                    self.device.unmap_memory(memory);
                    self.device.free_memory(memory, None);
                }
                Ok(out)
            }
            Err(r) => {
                unsafe { self.device.free_memory(memory, None) };
                Err(vk_err("vkMapMemory", r))
            }
        }
    }

    /// First memory type matching `type_bits` with all of `flags`.
    pub(super) fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
    }

    pub(super) fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub(super) fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub(super) fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub(super) fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub(super) fn decode_queue(&self) -> Option<(u32, vk::Queue)> {
        self.decode_queue_family.zip(self.decode_queue)
    }

    pub(super) fn encode_queue(&self) -> Option<(u32, vk::Queue)> {
        self.encode_queue_family.zip(self.encode_queue)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            if let Some(device) = Arc::get_mut(&mut self.device) {
                device.destroy_device(None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Safety: all queue submissions go through &mut component methods; the
// remaining shared state is immutable after creation.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}
