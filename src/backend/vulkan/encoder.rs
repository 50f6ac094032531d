//! Vulkan Video H.264 encoder component.
//!
//! Input frames are staged into an NV12 image and encoded against a
//! two-slot DPB with a single previous-frame reference. The driver
//! reports the written byte range through an encode feedback query;
//! SPS/PPS headers are serialized once at session creation and
//! prepended to every IDR packet. One encode is in flight at a time.

use super::context::VulkanDevice;
use super::decoder::vulkan_ctx;
use super::h264;
use super::resources::{nv12_copy_regions, transition_image, CodedImage, CommandContext, HostBuffer};
use super::session::{base_profile, h264_encode_profile, SessionParameters, VideoSession, DPB_SLOTS, PICTURE_FORMAT};
use super::vk_err;
use crate::backend::{Negotiated, Property, PropertyOutcome};
use crate::convert::Converter;
use crate::encode::EncodedPacket;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::format::{Codec, CodecDescriptor, Direction, PixelFormat, MAX_GOP};
use crate::retry::SubmitStatus;
use crate::surface::Surface;

use ash::vk;
use ash::vk::native as std_h264;
use bytes::Bytes;
use std::sync::Arc;

/// Encode input slots: one in flight, one being filled.
const ENCODE_SURFACES: usize = 2;
/// Output bitstream capacity; one coded picture never comes close.
const OUTPUT_CAPACITY: u64 = 4 << 20;

/// Live encode session state.
struct EncodeSession {
    device: Arc<ash::Device>,
    session: VideoSession,
    parameters: SessionParameters,
    encode_fp: ash::khr::video_encode_queue::DeviceFn,
    queue: vk::Queue,
    /// Staged input picture, uploaded before each encode.
    input: CodedImage,
    dpb: Vec<CodedImage>,
    staging: HostBuffer,
    output: HostBuffer,
    commands: CommandContext,
    query_pool: vk::QueryPool,
    /// Serialized SPS/PPS, prepended to IDR packets.
    headers: Vec<u8>,
    /// DPB slot the next picture reconstructs into.
    slot: usize,
    /// Slot holding the last reconstructed picture, once one exists.
    last_slot: Option<usize>,
    frame_num: u32,
    /// Next submission must reset coding state and install rate control.
    needs_reset: bool,
}

impl std::fmt::Debug for EncodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeSession")
            .field("session", &self.session)
            .field("slot", &self.slot)
            .field("last_slot", &self.last_slot)
            .field("frame_num", &self.frame_num)
            .finish()
    }
}

/// Packet metadata between an accepted submit and its poll.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    pts: i64,
    keyframe: bool,
}

/// Vulkan Video encoder component.
#[derive(Debug)]
pub struct VulkanEncoder {
    device: DeviceHandle,
    desc: CodecDescriptor,
    converter: Converter,
    scratch: Vec<u8>,
    session: Option<EncodeSession>,
    in_flight: Option<InFlight>,
    frames_since_idr: u32,
    closed: bool,
}

impl VulkanEncoder {
    pub(crate) fn create(
        device: &DeviceHandle,
        desc: &CodecDescriptor,
    ) -> Result<(Self, Negotiated)> {
        let ctx = vulkan_ctx(device);
        if desc.codec != Codec::H264 {
            return Err(Error::Unsupported(format!(
                "vulkan encode for {} is not implemented",
                desc.codec
            )));
        }
        if !ctx.supports(Direction::Encode, Codec::H264) {
            return Err(Error::Unsupported(
                "driver lacks VK_KHR_video_encode_h264".into(),
            ));
        }
        if !matches!(desc.surface_format, PixelFormat::Nv12 | PixelFormat::Bgra) {
            return Err(Error::Unsupported(format!(
                "encode input format {:?}",
                desc.surface_format
            )));
        }

        let session = EncodeSession::create(ctx, desc)?;
        let negotiated = Negotiated {
            descriptor: desc.clone(),
            suggested_surfaces: ENCODE_SURFACES,
            ring_depth: crate::ring::MIN_RING,
        };
        let enc = Self {
            device: device.clone(),
            desc: desc.clone(),
            converter: Converter::new(desc.matrix, desc.range),
            scratch: Vec::new(),
            session: Some(session),
            in_flight: None,
            frames_since_idr: 0,
            closed: false,
        };
        Ok((enc, negotiated))
    }

    pub(crate) fn submit(
        &mut self,
        _surface: &Surface,
        frame: &[u8],
        pts: i64,
        force_idr: bool,
    ) -> Result<SubmitStatus> {
        if self.closed {
            return Err(Error::SessionFailed("encoder component closed".into()));
        }
        // One picture in flight at a time.
        if self.in_flight.is_some() {
            return Ok(SubmitStatus::Busy);
        }
        if frame.len() < self.desc.frame_size() {
            return Err(Error::InvalidData(format!(
                "frame of {} bytes, expected {}",
                frame.len(),
                self.desc.frame_size()
            )));
        }

        let idr = force_idr
            || self.frames_since_idr == 0
            || (self.desc.gop != MAX_GOP && self.frames_since_idr >= self.desc.gop);

        let nv12: &[u8] = match self.desc.surface_format {
            PixelFormat::Nv12 => frame,
            PixelFormat::Bgra => {
                let len = PixelFormat::Nv12.buffer_size(self.desc.width, self.desc.height);
                self.scratch.resize(len, 0);
                self.converter.bgra_to_nv12(
                    self.desc.width,
                    self.desc.height,
                    frame,
                    &mut self.scratch,
                )?;
                &self.scratch
            }
            other => return Err(Error::Unsupported(format!("encode input format {other:?}"))),
        };

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::SessionFailed("encoder component closed".into()))?;
        session.record_and_submit(vulkan_ctx(&self.device), &self.desc, nv12, idr)?;

        self.frames_since_idr = if idr { 1 } else { self.frames_since_idr + 1 };
        self.in_flight = Some(InFlight { pts, keyframe: idr });
        Ok(SubmitStatus::Accepted)
    }

    pub(crate) fn sync_done(&mut self) -> Result<bool> {
        if self.in_flight.is_none() {
            return Ok(true);
        }
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::SessionFailed("sync without session".into()))?;
        session.commands.done()
    }

    pub(crate) fn poll_packet(&mut self) -> Result<Option<EncodedPacket>> {
        let Some(frame) = self.in_flight.take() else {
            return Ok(None);
        };
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::SessionFailed("poll without session".into()))?;

        // Feedback values follow flag bit order: buffer offset, bytes
        // written.
        let mut feedback = [[0u32; 2]; 1];
        unsafe {
            session
                .device
                .get_query_pool_results(
                    session.query_pool,
                    0,
                    &mut feedback,
                    vk::QueryResultFlags::WAIT,
                )
                .map_err(|r| vk_err("vkGetQueryPoolResults", r))?;
        }
        let [offset, written] = feedback[0];
        if written == 0 {
            return Err(Error::SessionFailed("encoder produced no bytes".into()));
        }

        let coded = session.output.read(offset as usize, written as usize);
        let mut payload =
            Vec::with_capacity(coded.len() + if frame.keyframe { session.headers.len() } else { 0 });
        if frame.keyframe {
            payload.extend_from_slice(&session.headers);
        }
        payload.extend_from_slice(coded);

        Ok(Some(EncodedPacket {
            data: Bytes::from(payload),
            pts: frame.pts,
            keyframe: frame.keyframe,
        }))
    }

    pub(crate) fn try_set_property(&mut self, property: Property) -> Result<PropertyOutcome> {
        match property {
            Property::Bitrate(kbps) => {
                self.desc.bitrate_kbps = kbps;
                self.reinstall_rate_control();
                Ok(PropertyOutcome::Applied)
            }
            Property::Framerate(fps) => {
                self.desc.framerate = fps;
                self.reinstall_rate_control();
                Ok(PropertyOutcome::Applied)
            }
            // QP bounds are baked into the rate control layer at session
            // init, as on most hardware encoders.
            Property::Qp(_) => Ok(PropertyOutcome::NeedsReset),
        }
    }

    /// New rate control takes effect through a coding-state reset; the
    /// stream restarts at an IDR so the change lands on a clean GOP.
    fn reinstall_rate_control(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.needs_reset = true;
        }
        self.frames_since_idr = 0;
    }

    pub(crate) fn reset(&mut self, desc: &CodecDescriptor) -> Result<()> {
        desc.validate()?;
        if desc.width != self.desc.width || desc.height != self.desc.height {
            return Err(Error::Incompatible(
                "reset cannot change dimensions".into(),
            ));
        }
        if desc.codec != self.desc.codec {
            return Err(Error::Incompatible("reset cannot change codec".into()));
        }
        // Tear the old session down before the rebuild touches the
        // driver again.
        self.session = None;
        let session = EncodeSession::create(vulkan_ctx(&self.device), desc)?;
        self.session = Some(session);
        self.desc = desc.clone();
        self.converter = Converter::new(desc.matrix, desc.range);
        self.in_flight = None;
        // Reinitialized components start a fresh GOP.
        self.frames_since_idr = 0;
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.session = None;
        self.in_flight = None;
        self.closed = true;
    }
}

impl EncodeSession {
    fn create(ctx: &VulkanDevice, desc: &CodecDescriptor) -> Result<Self> {
        let (width, height) = (desc.width, desc.height);

        let session = VideoSession::create(ctx, Direction::Encode, width, height)?;
        let parameters = SessionParameters::for_encode(&session, width, height)?;

        let encode_fp = ash::khr::video_encode_queue::DeviceFn::load(|name| unsafe {
            std::mem::transmute(
                ctx.instance()
                    .get_device_proc_addr(ctx.device().handle(), name.as_ptr()),
            )
        });
        let headers = parameters.encoded_headers(&encode_fp)?;

        let (queue_family, queue) = ctx
            .encode_queue()
            .ok_or_else(|| Error::Unsupported("no encode queue".into()))?;

        let mut encode_codec = h264_encode_profile();
        let profile = base_profile(Direction::Encode).push_next(&mut encode_codec);

        let input = CodedImage::new(
            ctx,
            width,
            height,
            PICTURE_FORMAT,
            vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR | vk::ImageUsageFlags::TRANSFER_DST,
            &profile,
            false,
        )?;
        let mut dpb = Vec::with_capacity(DPB_SLOTS as usize);
        for _ in 0..DPB_SLOTS {
            dpb.push(CodedImage::new(
                ctx,
                width,
                height,
                PICTURE_FORMAT,
                vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR,
                &profile,
                false,
            )?);
        }

        let staging = HostBuffer::new(
            ctx,
            PixelFormat::Nv12.buffer_size(width, height) as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            None,
        )?;
        let limits = session.limits();
        let output_size =
            OUTPUT_CAPACITY.next_multiple_of(limits.min_bitstream_size_alignment.max(1));
        let output = HostBuffer::new(
            ctx,
            output_size,
            vk::BufferUsageFlags::VIDEO_ENCODE_DST_KHR,
            Some(&profile),
        )?;
        let commands = CommandContext::new(ctx, queue_family)?;

        let device = ctx.device().clone();
        let mut feedback_info = vk::QueryPoolVideoEncodeFeedbackCreateInfoKHR::default()
            .encode_feedback_flags(
                vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BUFFER_OFFSET
                    | vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BYTES_WRITTEN,
            );
        let mut query_codec = h264_encode_profile();
        let mut query_profile = base_profile(Direction::Encode).push_next(&mut query_codec);
        let pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::VIDEO_ENCODE_FEEDBACK_KHR)
            .query_count(1)
            .push_next(&mut query_profile)
            .push_next(&mut feedback_info);
        let query_pool = unsafe {
            device
                .create_query_pool(&pool_info, None)
                .map_err(|r| vk_err("vkCreateQueryPool", r))?
        };

        tracing::debug!(width, height, bitrate_kbps = desc.bitrate_kbps, "vulkan encode session created");

        Ok(Self {
            device,
            session,
            parameters,
            encode_fp,
            queue,
            input,
            dpb,
            staging,
            output,
            commands,
            query_pool,
            headers,
            slot: 0,
            last_slot: None,
            frame_num: 0,
            needs_reset: true,
        })
    }

    /// Record upload, encode, and feedback query for one NV12 frame.
    fn record_and_submit(
        &mut self,
        ctx: &VulkanDevice,
        desc: &CodecDescriptor,
        nv12: &[u8],
        idr: bool,
    ) -> Result<()> {
        let device = ctx.device().clone();

        if idr {
            self.frame_num = 0;
            self.last_slot = None;
        }
        self.staging.write(nv12)?;

        let slot = self.slot;
        let extent = self.session.coded_extent();

        self.commands.begin()?;
        let cb = self.commands.buffer();

        unsafe {
            device.cmd_reset_query_pool(cb, self.query_pool, 0, 1);
        }

        // Stage the input picture.
        transition_image(
            &device,
            cb,
            self.input.image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let regions = nv12_copy_regions(desc.width, desc.height);
        unsafe {
            device.cmd_copy_buffer_to_image(
                cb,
                self.staging.buffer(),
                self.input.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }
        transition_image(
            &device,
            cb,
            self.input.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
        );
        transition_image(
            &device,
            cb,
            self.dpb[slot].image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::VIDEO_ENCODE_DPB_KHR,
        );

        let src_resource = vk::VideoPictureResourceInfoKHR::default()
            .image_view_binding(self.input.view())
            .coded_extent(extent)
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .base_array_layer(0);
        let setup_resource = vk::VideoPictureResourceInfoKHR::default()
            .image_view_binding(self.dpb[slot].view())
            .coded_extent(extent)
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .base_array_layer(0);

        let reference = self.last_slot.filter(|_| !idr).map(|prev| {
            let resource = vk::VideoPictureResourceInfoKHR::default()
                .image_view_binding(self.dpb[prev].view())
                .coded_extent(extent)
                .coded_offset(vk::Offset2D { x: 0, y: 0 })
                .base_array_layer(0);
            (prev, resource)
        });

        // Slots bound for this coding scope: the setup slot (inactive
        // until the encode activates it) plus the active reference.
        let mut begin_slots = vec![vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(-1)
            .picture_resource(&setup_resource)];
        let mut ref_std: std_h264::StdVideoEncodeH264ReferenceInfo = unsafe { std::mem::zeroed() };
        let mut ref_h264_begin;
        let mut ref_h264_encode;
        let mut ref_slots = Vec::new();
        if let Some((prev, ref resource)) = reference {
            ref_std.FrameNum = self.frame_num.wrapping_sub(1);
            ref_std.primary_pic_type =
                std_h264::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_P;
            ref_h264_begin =
                vk::VideoEncodeH264DpbSlotInfoKHR::default().std_reference_info(&ref_std);
            ref_h264_encode =
                vk::VideoEncodeH264DpbSlotInfoKHR::default().std_reference_info(&ref_std);
            begin_slots.push(
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(prev as i32)
                    .picture_resource(resource)
                    .push_next(&mut ref_h264_begin),
            );
            ref_slots.push(
                // Same slot, re-declared as an active encode reference.
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(prev as i32)
                    .picture_resource(resource)
                    .push_next(&mut ref_h264_encode),
            );
        }

        // CBR rate control with the current target; QP bounds narrow the
        // layer when configured.
        let mut h264_layer = vk::VideoEncodeH264RateControlLayerInfoKHR::default();
        if let Some(qp) = desc.qp {
            let min = vk::VideoEncodeH264QpKHR {
                qp_i: qp.min as i32,
                qp_p: qp.min as i32,
                qp_b: qp.min as i32,
            };
            let max = vk::VideoEncodeH264QpKHR {
                qp_i: qp.max as i32,
                qp_p: qp.max as i32,
                qp_b: qp.max as i32,
            };
            h264_layer = h264_layer
                .use_min_qp(true)
                .min_qp(min)
                .use_max_qp(true)
                .max_qp(max);
        }
        let layer = vk::VideoEncodeRateControlLayerInfoKHR::default()
            .average_bitrate(u64::from(desc.bitrate_kbps) * 1000)
            .max_bitrate(u64::from(desc.bitrate_kbps) * 1000)
            .frame_rate_numerator(desc.framerate)
            .frame_rate_denominator(1)
            .push_next(&mut h264_layer);
        let layers = [layer];
        let gop = if desc.gop == MAX_GOP { u32::MAX } else { desc.gop };
        let mut h264_rc = vk::VideoEncodeH264RateControlInfoKHR::default()
            .gop_frame_count(gop)
            .idr_period(gop)
            .consecutive_b_frame_count(0)
            .temporal_layer_count(1);
        let mut rate_control = vk::VideoEncodeRateControlInfoKHR::default()
            .rate_control_mode(vk::VideoEncodeRateControlModeFlagsKHR::CBR)
            .layers(&layers)
            .virtual_buffer_size_in_ms(1000)
            .initial_virtual_buffer_size_in_ms(0)
            .push_next(&mut h264_rc);

        let mut begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(self.session.handle())
            .video_session_parameters(self.parameters.handle())
            .reference_slots(&begin_slots);
        if !self.needs_reset {
            // Established sessions declare their rate control state at
            // scope begin.
            begin_info = begin_info.push_next(&mut rate_control);
        }
        unsafe {
            (self.session.video_fp().cmd_begin_video_coding_khr)(cb, &begin_info);
        }

        if self.needs_reset {
            let reset = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::RESET);
            let install = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::ENCODE_RATE_CONTROL)
                .push_next(&mut rate_control);
            unsafe {
                (self.session.video_fp().cmd_control_video_coding_khr)(cb, &reset);
                (self.session.video_fp().cmd_control_video_coding_khr)(cb, &install);
            }
            self.needs_reset = false;
        }

        // Std picture info for the frame being encoded.
        let ref_lists = match reference {
            Some((prev, _)) => h264::single_reference_lists(prev as u8),
            None => h264::empty_reference_lists(),
        };
        let mut std_picture: std_h264::StdVideoEncodeH264PictureInfo =
            unsafe { std::mem::zeroed() };
        if idr {
            std_picture.flags.set_IdrPicFlag(1);
            std_picture.primary_pic_type =
                std_h264::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_IDR;
        } else {
            std_picture.primary_pic_type =
                std_h264::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_P;
        }
        std_picture.flags.set_is_reference(1);
        std_picture.frame_num = self.frame_num;
        std_picture.PicOrderCnt = 2 * self.frame_num as i32;
        std_picture.pRefLists = &ref_lists;

        let mut std_slice: std_h264::StdVideoEncodeH264SliceHeader =
            unsafe { std::mem::zeroed() };
        std_slice.slice_type = if idr {
            std_h264::StdVideoH264SliceType_STD_VIDEO_H264_SLICE_TYPE_I
        } else {
            std_h264::StdVideoH264SliceType_STD_VIDEO_H264_SLICE_TYPE_P
        };
        let nalu_slices =
            [vk::VideoEncodeH264NaluSliceInfoKHR::default().std_slice_header(&std_slice)];
        let mut h264_picture = vk::VideoEncodeH264PictureInfoKHR::default()
            .nalu_slice_entries(&nalu_slices)
            .std_picture_info(&std_picture);

        let mut setup_std: std_h264::StdVideoEncodeH264ReferenceInfo =
            unsafe { std::mem::zeroed() };
        setup_std.FrameNum = self.frame_num;
        setup_std.primary_pic_type = std_picture.primary_pic_type;
        let mut setup_h264 =
            vk::VideoEncodeH264DpbSlotInfoKHR::default().std_reference_info(&setup_std);
        let setup_slot = vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(slot as i32)
            .picture_resource(&setup_resource)
            .push_next(&mut setup_h264);

        let mut encode_info = vk::VideoEncodeInfoKHR::default()
            .dst_buffer(self.output.buffer())
            .dst_buffer_offset(0)
            .dst_buffer_range(self.output.size())
            .src_picture_resource(src_resource)
            .setup_reference_slot(&setup_slot)
            .push_next(&mut h264_picture);
        if !ref_slots.is_empty() {
            encode_info = encode_info.reference_slots(&ref_slots);
        }

        unsafe {
            device.cmd_begin_query(cb, self.query_pool, 0, vk::QueryControlFlags::empty());
            (self.encode_fp.cmd_encode_video_khr)(cb, &encode_info);
            device.cmd_end_query(cb, self.query_pool, 0);
            let end_info = vk::VideoEndCodingInfoKHR::default();
            (self.session.video_fp().cmd_end_video_coding_khr)(cb, &end_info);
        }

        self.commands.submit(self.queue)?;

        self.last_slot = Some(slot);
        self.slot = (slot + 1) % self.dpb.len();
        self.frame_num = self.frame_num.wrapping_add(1);
        Ok(())
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_query_pool(self.query_pool, None);
        }
    }
}
