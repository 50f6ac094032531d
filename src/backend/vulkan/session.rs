//! Video session objects and their driver-required memory bindings.
//!
//! A `VkVideoSessionKHR` plus its bound memory and a
//! `VkVideoSessionParametersKHR` carrying the codec parameter sets.
//! Both directions share the same creation and binding path; only the
//! profile and the parameter-set payload differ.

use super::context::VulkanDevice;
use super::{check, h264, vk_err};
use crate::error::{Error, Result};
use crate::format::Direction;

use ash::vk;
use std::ptr;
use std::sync::Arc;

/// DPB slots used by the low-latency sessions here: current plus one
/// reference.
pub(super) const DPB_SLOTS: u32 = 2;

/// NV12 as Vulkan sees it.
pub(super) const PICTURE_FORMAT: vk::Format = vk::Format::G8_B8R8_2PLANE_420_UNORM;

/// H.264 decode profile chain tail.
pub(super) fn h264_decode_profile() -> vk::VideoDecodeH264ProfileInfoKHR<'static> {
    vk::VideoDecodeH264ProfileInfoKHR::default()
        .std_profile_idc(vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH)
        .picture_layout(vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE)
}

/// H.264 encode profile chain tail.
pub(super) fn h264_encode_profile() -> vk::VideoEncodeH264ProfileInfoKHR<'static> {
    vk::VideoEncodeH264ProfileInfoKHR::default()
        .std_profile_idc(vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH)
}

/// Base profile info for 4:2:0 8-bit content.
pub(super) fn base_profile(direction: Direction) -> vk::VideoProfileInfoKHR<'static> {
    let op = match direction {
        Direction::Decode => vk::VideoCodecOperationFlagsKHR::DECODE_H264,
        Direction::Encode => vk::VideoCodecOperationFlagsKHR::ENCODE_H264,
    };
    vk::VideoProfileInfoKHR::default()
        .video_codec_operation(op)
        .chroma_subsampling(vk::VideoChromaSubsamplingFlagsKHR::TYPE_420)
        .luma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
        .chroma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
}

/// Driver limits the components size their buffers against.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct SessionLimits {
    pub min_bitstream_offset_alignment: u64,
    pub min_bitstream_size_alignment: u64,
    pub max_coded_extent: vk::Extent2D,
}

/// A video session with bound memory.
pub(super) struct VideoSession {
    device: Arc<ash::Device>,
    video_fp: ash::khr::video_queue::DeviceFn,
    session: vk::VideoSessionKHR,
    memory: Vec<vk::DeviceMemory>,
    coded_extent: vk::Extent2D,
    limits: SessionLimits,
}

impl std::fmt::Debug for VideoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSession")
            .field("coded_extent", &self.coded_extent)
            .finish()
    }
}

impl VideoSession {
    /// Create an H.264 session for `direction` at the given coded size.
    pub fn create(
        ctx: &VulkanDevice,
        direction: Direction,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let device = ctx.device().clone();
        let instance = ctx.instance();

        let video_fp = ash::khr::video_queue::DeviceFn::load(|name| unsafe {
            std::mem::transmute(instance.get_device_proc_addr(device.handle(), name.as_ptr()))
        });

        let (limits, std_header_version) = Self::query_capabilities(ctx, direction)?;
        if width > limits.max_coded_extent.width || height > limits.max_coded_extent.height {
            return Err(Error::Unsupported(format!(
                "{width}x{height} exceeds driver maximum {}x{}",
                limits.max_coded_extent.width, limits.max_coded_extent.height
            )));
        }

        let queue_family = match direction {
            Direction::Decode => ctx.decode_queue(),
            Direction::Encode => ctx.encode_queue(),
        }
        .ok_or_else(|| Error::Unsupported("no video queue for direction".into()))?
        .0;

        let coded_extent = vk::Extent2D { width, height };

        let mut decode_codec = h264_decode_profile();
        let mut encode_codec = h264_encode_profile();
        let mut profile = base_profile(direction);
        profile = match direction {
            Direction::Decode => profile.push_next(&mut decode_codec),
            Direction::Encode => profile.push_next(&mut encode_codec),
        };

        let create_info = vk::VideoSessionCreateInfoKHR::default()
            .queue_family_index(queue_family)
            .video_profile(&profile)
            .picture_format(PICTURE_FORMAT)
            .max_coded_extent(coded_extent)
            .reference_picture_format(PICTURE_FORMAT)
            .max_dpb_slots(DPB_SLOTS)
            .max_active_reference_pictures(1)
            .std_header_version(&std_header_version);

        let mut session = vk::VideoSessionKHR::null();
        check("vkCreateVideoSessionKHR", unsafe {
            (video_fp.create_video_session_khr)(
                device.handle(),
                &create_info,
                ptr::null(),
                &mut session,
            )
        })?;

        let memory = match Self::bind_memory(ctx, &device, &video_fp, session) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe {
                    (video_fp.destroy_video_session_khr)(device.handle(), session, ptr::null())
                };
                return Err(e);
            }
        };

        Ok(Self {
            device,
            video_fp,
            session,
            memory,
            coded_extent,
            limits,
        })
    }

    /// Query driver capabilities for the H.264 profile in `direction`.
    fn query_capabilities(
        ctx: &VulkanDevice,
        direction: Direction,
    ) -> Result<(SessionLimits, vk::ExtensionProperties)> {
        let instance = ctx.instance();
        let instance_fp = ash::khr::video_queue::InstanceFn::load(|name| unsafe {
            std::mem::transmute(
                ctx.entry()
                    .static_fn()
                    .get_instance_proc_addr(instance.handle(), name.as_ptr()),
            )
        });

        let mut decode_codec = h264_decode_profile();
        let mut encode_codec = h264_encode_profile();
        let mut profile = base_profile(direction);
        profile = match direction {
            Direction::Decode => profile.push_next(&mut decode_codec),
            Direction::Encode => profile.push_next(&mut encode_codec),
        };

        let mut decode_caps = vk::VideoDecodeCapabilitiesKHR::default();
        let mut encode_caps = vk::VideoEncodeCapabilitiesKHR::default();
        let mut caps = vk::VideoCapabilitiesKHR::default();
        caps = match direction {
            Direction::Decode => caps.push_next(&mut decode_caps),
            Direction::Encode => caps.push_next(&mut encode_caps),
        };

        check("vkGetPhysicalDeviceVideoCapabilitiesKHR", unsafe {
            (instance_fp.get_physical_device_video_capabilities_khr)(
                ctx.physical(),
                &profile,
                &mut caps,
            )
        })?;

        Ok((
            SessionLimits {
                min_bitstream_offset_alignment: caps.min_bitstream_buffer_offset_alignment,
                min_bitstream_size_alignment: caps.min_bitstream_buffer_size_alignment,
                max_coded_extent: caps.max_coded_extent,
            },
            caps.std_header_version,
        ))
    }

    /// Two-pass requirements query, then allocate and bind each region.
    fn bind_memory(
        ctx: &VulkanDevice,
        device: &ash::Device,
        video_fp: &ash::khr::video_queue::DeviceFn,
        session: vk::VideoSessionKHR,
    ) -> Result<Vec<vk::DeviceMemory>> {
        let mut count = 0u32;
        check("vkGetVideoSessionMemoryRequirementsKHR", unsafe {
            (video_fp.get_video_session_memory_requirements_khr)(
                device.handle(),
                session,
                &mut count,
                ptr::null_mut(),
            )
        })?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut requirements =
            vec![vk::VideoSessionMemoryRequirementsKHR::default(); count as usize];
        check("vkGetVideoSessionMemoryRequirementsKHR", unsafe {
            (video_fp.get_video_session_memory_requirements_khr)(
                device.handle(),
                session,
                &mut count,
                requirements.as_mut_ptr(),
            )
        })?;

        let mut memories = Vec::new();
        let mut bind_infos = Vec::new();
        for req in &requirements {
            let memory_type = ctx
                .find_memory_type(
                    req.memory_requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )
                .or_else(|| ctx.find_memory_type(req.memory_requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::empty()))
                .ok_or_else(|| {
                    Error::Unsupported("no memory type for video session binding".into())
                })?;

            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(req.memory_requirements.size)
                .memory_type_index(memory_type);
            let memory = unsafe {
                device.allocate_memory(&alloc_info, None).map_err(|r| {
                    for m in &memories {
                        device.free_memory(*m, None);
                    }
                    vk_err("vkAllocateMemory(session)", r)
                })?
            };
            memories.push(memory);
            bind_infos.push(
                vk::BindVideoSessionMemoryInfoKHR::default()
                    .memory_bind_index(req.memory_bind_index)
                    .memory(memory)
                    .memory_offset(0)
                    .memory_size(req.memory_requirements.size),
            );
        }

        let result = unsafe {
            (video_fp.bind_video_session_memory_khr)(
                device.handle(),
                session,
                bind_infos.len() as u32,
                bind_infos.as_ptr(),
            )
        };
        if result != vk::Result::SUCCESS {
            for memory in &memories {
                unsafe { device.free_memory(*memory, None) };
            }
            return Err(vk_err("vkBindVideoSessionMemoryKHR", result));
        }
        Ok(memories)
    }

    pub fn handle(&self) -> vk::VideoSessionKHR {
        self.session
    }

    pub fn coded_extent(&self) -> vk::Extent2D {
        self.coded_extent
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn video_fp(&self) -> &ash::khr::video_queue::DeviceFn {
        &self.video_fp
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            (self.video_fp.destroy_video_session_khr)(
                self.device.handle(),
                self.session,
                ptr::null(),
            );
            for memory in &self.memory {
                self.device.free_memory(*memory, None);
            }
        }
    }
}

// Safety: the session handle is only touched from &mut component methods.
unsafe impl Send for VideoSession {}

/// Codec parameter sets bound to a session.
pub(super) struct SessionParameters {
    device: Arc<ash::Device>,
    video_fp: ash::khr::video_queue::DeviceFn,
    params: vk::VideoSessionParametersKHR,
}

impl std::fmt::Debug for SessionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParameters").finish()
    }
}

impl SessionParameters {
    /// Decode parameters carrying the stream's SPS and PPS.
    pub fn for_decode(
        session: &VideoSession,
        sps: &h264::ParsedSps,
        pps: &h264::ParsedPps,
    ) -> Result<Self> {
        let std_sps = [h264::std_sps(sps)];
        let std_pps = [h264::std_pps(pps)];
        let add_info = vk::VideoDecodeH264SessionParametersAddInfoKHR::default()
            .std_sp_ss(&std_sps)
            .std_pp_ss(&std_pps);
        let mut codec_info = vk::VideoDecodeH264SessionParametersCreateInfoKHR::default()
            .max_std_sps_count(1)
            .max_std_pps_count(1)
            .parameters_add_info(&add_info);
        let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
            .video_session(session.session)
            .push_next(&mut codec_info);
        Self::create(session, &create_info)
    }

    /// Encode parameters carrying a synthesized SPS and PPS.
    pub fn for_encode(session: &VideoSession, width: u32, height: u32) -> Result<Self> {
        let std_sps = [h264::encode_sps(width, height)];
        let std_pps = [h264::encode_pps()];
        let add_info = vk::VideoEncodeH264SessionParametersAddInfoKHR::default()
            .std_sp_ss(&std_sps)
            .std_pp_ss(&std_pps);
        let mut codec_info = vk::VideoEncodeH264SessionParametersCreateInfoKHR::default()
            .max_std_sps_count(1)
            .max_std_pps_count(1)
            .parameters_add_info(&add_info);
        let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
            .video_session(session.session)
            .push_next(&mut codec_info);
        Self::create(session, &create_info)
    }

    fn create(
        session: &VideoSession,
        create_info: &vk::VideoSessionParametersCreateInfoKHR<'_>,
    ) -> Result<Self> {
        let mut params = vk::VideoSessionParametersKHR::null();
        check("vkCreateVideoSessionParametersKHR", unsafe {
            (session.video_fp.create_video_session_parameters_khr)(
                session.device.handle(),
                create_info,
                ptr::null(),
                &mut params,
            )
        })?;
        Ok(Self {
            device: session.device.clone(),
            video_fp: session.video_fp.clone(),
            params,
        })
    }

    /// Ask the driver to serialize the SPS/PPS headers (encode only);
    /// prepended to the first keyframe packet.
    pub fn encoded_headers(
        &self,
        encode_fp: &ash::khr::video_encode_queue::DeviceFn,
    ) -> Result<Vec<u8>> {
        let mut h264_get = vk::VideoEncodeH264SessionParametersGetInfoKHR::default()
            .write_std_sps(true)
            .write_std_pps(true);
        let get_info = vk::VideoEncodeSessionParametersGetInfoKHR::default()
            .video_session_parameters(self.params)
            .push_next(&mut h264_get);

        let mut size = 0usize;
        check("vkGetEncodedVideoSessionParametersKHR", unsafe {
            (encode_fp.get_encoded_video_session_parameters_khr)(
                self.device.handle(),
                &get_info,
                ptr::null_mut(),
                &mut size,
                ptr::null_mut(),
            )
        })?;

        let mut data = vec![0u8; size];
        check("vkGetEncodedVideoSessionParametersKHR", unsafe {
            (encode_fp.get_encoded_video_session_parameters_khr)(
                self.device.handle(),
                &get_info,
                ptr::null_mut(),
                &mut size,
                data.as_mut_ptr().cast(),
            )
        })?;
        data.truncate(size);
        Ok(data)
    }

    pub fn handle(&self) -> vk::VideoSessionParametersKHR {
        self.params
    }
}

impl Drop for SessionParameters {
    fn drop(&mut self) {
        unsafe {
            (self.video_fp.destroy_video_session_parameters_khr)(
                self.device.handle(),
                self.params,
                ptr::null(),
            );
        }
    }
}

unsafe impl Send for SessionParameters {}
