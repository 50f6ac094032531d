//! GPU resources shared by the encode and decode components: coded
//! images, host-visible staging buffers, and the per-component command
//! context.

use super::context::VulkanDevice;
use super::vk_err;
use crate::error::{Error, Result};

use ash::vk;
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;

/// An NV12 image usable by a video session, with its view and memory.
///
/// Allocated exportable so the decode output can leave the process as a
/// shared handle.
pub(super) struct CodedImage {
    device: Arc<ash::Device>,
    image: vk::Image,
    view: vk::ImageView,
    memory: vk::DeviceMemory,
    size: u64,
}

impl std::fmt::Debug for CodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodedImage").field("size", &self.size).finish()
    }
}

impl CodedImage {
    pub fn new(
        ctx: &VulkanDevice,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        profile: &vk::VideoProfileInfoKHR<'_>,
        exportable: bool,
    ) -> Result<Self> {
        let device = ctx.device().clone();

        let profiles = [*profile];
        let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);
        let mut external =
            vk::ExternalMemoryImageCreateInfo::default()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut profile_list);
        if exportable {
            image_info = image_info.push_next(&mut external);
        }

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(|r| vk_err("vkCreateImage", r))?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .ok_or_else(|| Error::Unsupported("no device-local memory type".into()))?;

        let mut export_info = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        if exportable {
            alloc_info = alloc_info.push_next(&mut export_info);
        }

        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|r| {
                device.destroy_image(image, None);
                vk_err("vkAllocateMemory(image)", r)
            })?
        };
        unsafe {
            device.bind_image_memory(image, memory, 0).map_err(|r| {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
                vk_err("vkBindImageMemory", r)
            })?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = unsafe {
            device.create_image_view(&view_info, None).map_err(|r| {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
                vk_err("vkCreateImageView", r)
            })?
        };

        Ok(Self {
            device,
            image,
            view,
            memory,
            size: requirements.size,
        })
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Duplicate the backing allocation as an opaque fd.
    pub fn export_fd(&self, ctx: &VulkanDevice) -> Result<OwnedFd> {
        let get_fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(self.memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let fd_fn = ash::khr::external_memory_fd::Device::new(ctx.instance(), &self.device);
        let fd = unsafe {
            fd_fn
                .get_memory_fd(&get_fd_info)
                .map_err(|r| vk_err("vkGetMemoryFdKHR", r))?
        };
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl Drop for CodedImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

unsafe impl Send for CodedImage {}

/// A persistently mapped host-visible buffer.
pub(super) struct HostBuffer {
    device: Arc<ash::Device>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    ptr: NonNull<u8>,
    size: u64,
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer").field("size", &self.size).finish()
    }
}

impl HostBuffer {
    pub fn new(
        ctx: &VulkanDevice,
        size: u64,
        usage: vk::BufferUsageFlags,
        profile: Option<&vk::VideoProfileInfoKHR<'_>>,
    ) -> Result<Self> {
        let device = ctx.device().clone();

        let profiles: Vec<vk::VideoProfileInfoKHR<'_>> = profile.into_iter().copied().collect();
        let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);

        let mut buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if profile.is_some() {
            buffer_info = buffer_info.push_next(&mut profile_list);
        }

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(|r| vk_err("vkCreateBuffer", r))?
        };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type = ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .ok_or_else(|| Error::Unsupported("no host-visible memory type".into()))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|r| {
                device.destroy_buffer(buffer, None);
                vk_err("vkAllocateMemory(buffer)", r)
            })?
        };
        unsafe {
            device.bind_buffer_memory(buffer, memory, 0).map_err(|r| {
                device.free_memory(memory, None);
                device.destroy_buffer(buffer, None);
                vk_err("vkBindBufferMemory", r)
            })?;
        }
        let ptr = unsafe {
            device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|r| {
                    device.free_memory(memory, None);
                    device.destroy_buffer(buffer, None);
                    vk_err("vkMapMemory", r)
                })? as *mut u8
        };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::SessionFailed("vkMapMemory returned null".into()))?;

        Ok(Self {
            device,
            buffer,
            memory,
            ptr,
            size,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.size {
            return Err(Error::InvalidParameter(format!(
                "payload of {} bytes exceeds buffer of {}",
                data.len(),
                self.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        let len = len.min(self.size as usize - offset.min(self.size as usize));
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.unmap_memory(self.memory);
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

unsafe impl Send for HostBuffer {}

/// One command buffer, pool, and fence on a video queue family.
pub(super) struct CommandContext {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext").finish()
    }
}

impl CommandContext {
    pub fn new(ctx: &VulkanDevice, queue_family: u32) -> Result<Self> {
        let device = ctx.device().clone();

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|r| vk_err("vkCreateCommandPool", r))?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            device.allocate_command_buffers(&alloc_info).map_err(|r| {
                device.destroy_command_pool(pool, None);
                vk_err("vkAllocateCommandBuffers", r)
            })?
        };

        let fence = unsafe {
            device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|r| {
                    device.destroy_command_pool(pool, None);
                    vk_err("vkCreateFence", r)
                })?
        };

        Ok(Self {
            device,
            pool,
            buffer: buffers[0],
            fence,
        })
    }

    pub fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Reset and begin one-time recording.
    pub fn begin(&mut self) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|r| vk_err("vkResetCommandBuffer", r))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.buffer, &begin_info)
                .map_err(|r| vk_err("vkBeginCommandBuffer", r))?;
        }
        Ok(())
    }

    /// End recording and submit behind the fence.
    pub fn submit(&mut self, queue: vk::Queue) -> Result<()> {
        unsafe {
            self.device
                .end_command_buffer(self.buffer)
                .map_err(|r| vk_err("vkEndCommandBuffer", r))?;
            self.device
                .reset_fences(&[self.fence])
                .map_err(|r| vk_err("vkResetFences", r))?;
            let submit_info =
                vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&self.buffer));
            self.device
                .queue_submit(queue, &[submit_info], self.fence)
                .map_err(|r| vk_err("vkQueueSubmit", r))?;
        }
        Ok(())
    }

    /// Non-blocking fence poll.
    pub fn done(&self) -> Result<bool> {
        match unsafe { self.device.get_fence_status(self.fence) } {
            Ok(signaled) => Ok(signaled),
            Err(r) => Err(vk_err("vkGetFenceStatus", r)),
        }
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

unsafe impl Send for CommandContext {}

/// Record an image layout transition with sync2 video stages.
pub(super) fn transition_image(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );
    let dependency =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    unsafe { device.cmd_pipeline_barrier2(cb, &dependency) };
}

/// NV12 plane copy regions for buffer/image transfer, tightly packed.
pub(super) fn nv12_copy_regions(width: u32, height: u32) -> [vk::BufferImageCopy; 2] {
    let luma = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::PLANE_0)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        });
    let chroma = vk::BufferImageCopy::default()
        .buffer_offset(u64::from(width) * u64::from(height))
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::PLANE_1)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width: width / 2,
            height: height / 2,
            depth: 1,
        });
    [luma, chroma]
}
