//! Vulkan Video H.264 decoder component.
//!
//! Annex B input. SPS/PPS are absorbed until a session can be created
//! at the stream's coded size; slices then decode into a two-slot DPB
//! and are read back and converted into the output texture ring. One
//! decode is in flight at a time, matching the session protocol.

use super::context::VulkanDevice;
use super::resources::{nv12_copy_regions, transition_image, CodedImage, CommandContext, HostBuffer};
use super::session::{base_profile, h264_decode_profile, SessionParameters, VideoSession, DPB_SLOTS, PICTURE_FORMAT};
use super::h264;
use crate::backend::Negotiated;
use crate::convert::Converter;
use crate::decode::DecodedOutput;
use crate::device::{DeviceHandle, DeviceInner};
use crate::error::{Error, Result};
use crate::format::{Codec, CodecDescriptor, Direction, PixelFormat};
use crate::retry::SubmitStatus;
use crate::ring::{OutputRing, TextureDescriptor};
use crate::surface::Surface;

use ash::vk;
use std::os::fd::OwnedFd;

/// Decode surfaces suggested to the pool, margin included.
const DECODE_SURFACES: usize = 5;
/// Output ring depth.
const RING_DEPTH: usize = 4;
/// Bitstream staging capacity; one coded picture never comes close.
const BITSTREAM_CAPACITY: u64 = 4 << 20;

pub(super) fn vulkan_ctx(device: &DeviceHandle) -> &VulkanDevice {
    match &*device.inner {
        DeviceInner::Vulkan(d) => d,
        // Dispatch in backend::mod routes by device kind.
        _ => unreachable!("vulkan component bound to non-vulkan device"),
    }
}

/// Live decode session state, created once geometry is known.
struct DecodeSession {
    session: VideoSession,
    parameters: SessionParameters,
    decode_fp: ash::khr::video_decode_queue::DeviceFn,
    queue: vk::Queue,
    dpb: Vec<CodedImage>,
    bitstream: HostBuffer,
    readback: HostBuffer,
    commands: CommandContext,
    width: u32,
    height: u32,
    /// DPB slot the next frame decodes into.
    slot: usize,
    /// Slot holding the last decoded picture, once one exists.
    last_slot: Option<usize>,
    frame_num: u32,
    /// First submission must reset the session's coding state.
    needs_reset: bool,
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("session", &self.session)
            .field("slot", &self.slot)
            .field("last_slot", &self.last_slot)
            .field("frame_num", &self.frame_num)
            .finish()
    }
}

/// Frame metadata between an accepted submit and its poll.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    width: u32,
    height: u32,
    keyframe: bool,
    pts: i64,
}

/// Vulkan Video decoder component.
#[derive(Debug)]
pub struct VulkanDecoder {
    device: DeviceHandle,
    desc: CodecDescriptor,
    params: h264::ParameterSets,
    session: Option<DecodeSession>,
    ring: OutputRing<Vec<u8>>,
    converter: Converter,
    scratch: Vec<u8>,
    in_flight: Option<InFlight>,
    pending: Option<DecodedOutput>,
    pts_counter: i64,
    closed: bool,
}

impl VulkanDecoder {
    pub(crate) fn create(
        device: &DeviceHandle,
        desc: &CodecDescriptor,
    ) -> Result<(Self, Negotiated)> {
        let ctx = vulkan_ctx(device);
        if desc.codec != Codec::H264 {
            return Err(Error::Unsupported(format!(
                "vulkan decode for {} is not implemented",
                desc.codec
            )));
        }
        if !ctx.supports(Direction::Decode, Codec::H264) {
            return Err(Error::Unsupported(
                "driver lacks VK_KHR_video_decode_h264".into(),
            ));
        }
        if !matches!(desc.surface_format, PixelFormat::Nv12 | PixelFormat::Bgra) {
            return Err(Error::Unsupported(format!(
                "decode output format {:?}",
                desc.surface_format
            )));
        }

        let negotiated = Negotiated {
            descriptor: desc.clone(),
            suggested_surfaces: DECODE_SURFACES,
            ring_depth: RING_DEPTH,
        };
        let dec = Self {
            device: device.clone(),
            desc: desc.clone(),
            params: h264::ParameterSets::default(),
            session: None,
            ring: OutputRing::new(RING_DEPTH)?,
            converter: Converter::new(desc.matrix, desc.range),
            scratch: Vec::new(),
            in_flight: None,
            pending: None,
            pts_counter: 0,
            closed: false,
        };
        Ok((dec, negotiated))
    }

    pub(crate) fn submit(&mut self, packet: &[u8], _surface: &Surface) -> Result<SubmitStatus> {
        if self.closed {
            return Err(Error::SessionFailed("decoder component closed".into()));
        }
        // One picture in flight at a time.
        if self.in_flight.is_some() {
            return Ok(SubmitStatus::Busy);
        }

        let nals = h264::split_annexb(packet);
        if nals.is_empty() {
            return Err(Error::InvalidData("no NAL units in packet".into()));
        }
        for nal in &nals {
            self.params.absorb(nal)?;
        }

        let Some(slice) = nals.iter().copied().find(|n| h264::is_slice(n)) else {
            return Ok(SubmitStatus::NeedMoreInput);
        };
        if !self.params.complete() {
            // A slice before any SPS/PPS cannot be decoded.
            return Ok(SubmitStatus::NeedMoreInput);
        }

        if self.session.is_none() {
            self.session = Some(self.create_session()?);
        }
        let idr = h264::nal_type(slice) == h264::NAL_IDR;
        let (width, height) = {
            let session = self.session.as_ref().unwrap();
            (session.width, session.height)
        };
        self.record_and_submit(slice, idr)?;

        let pts = self.pts_counter;
        self.pts_counter += 1;
        self.in_flight = Some(InFlight {
            width,
            height,
            keyframe: idr,
            pts,
        });
        Ok(SubmitStatus::Accepted)
    }

    fn create_session(&self) -> Result<DecodeSession> {
        let ctx = vulkan_ctx(&self.device);
        let sps = self.params.sps().unwrap();
        let pps = self.params.pps().unwrap();
        let (width, height) = (sps.width, sps.height);

        let session = VideoSession::create(ctx, Direction::Decode, width, height)?;
        let parameters = SessionParameters::for_decode(&session, sps, pps)?;

        let decode_fp = ash::khr::video_decode_queue::DeviceFn::load(|name| unsafe {
            std::mem::transmute(
                ctx.instance()
                    .get_device_proc_addr(ctx.device().handle(), name.as_ptr()),
            )
        });
        let (queue_family, queue) = ctx
            .decode_queue()
            .ok_or_else(|| Error::Unsupported("no decode queue".into()))?;

        let mut decode_codec = h264_decode_profile();
        let profile = base_profile(Direction::Decode).push_next(&mut decode_codec);

        let mut dpb = Vec::with_capacity(DPB_SLOTS as usize);
        for _ in 0..DPB_SLOTS {
            dpb.push(CodedImage::new(
                ctx,
                width,
                height,
                PICTURE_FORMAT,
                vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR
                    | vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                &profile,
                true,
            )?);
        }

        let limits = session.limits();
        let bitstream_size = BITSTREAM_CAPACITY
            .next_multiple_of(limits.min_bitstream_size_alignment.max(1));
        let bitstream = HostBuffer::new(
            ctx,
            bitstream_size,
            vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR,
            Some(&profile),
        )?;
        let readback = HostBuffer::new(
            ctx,
            PixelFormat::Nv12.buffer_size(width, height) as u64,
            vk::BufferUsageFlags::TRANSFER_DST,
            None,
        )?;
        let commands = CommandContext::new(ctx, queue_family)?;

        tracing::debug!(width, height, "vulkan decode session created");

        Ok(DecodeSession {
            session,
            parameters,
            decode_fp,
            queue,
            dpb,
            bitstream,
            readback,
            commands,
            width,
            height,
            slot: 0,
            last_slot: None,
            frame_num: 0,
            needs_reset: true,
        })
    }

    /// Record upload, decode, and readback for one slice NAL.
    fn record_and_submit(&mut self, slice: &[u8], idr: bool) -> Result<()> {
        let ctx = vulkan_ctx(&self.device);
        let device = ctx.device().clone();
        let session = self.session.as_mut().unwrap();
        let sps = self.params.sps().unwrap();
        let pps = self.params.pps().unwrap();

        if idr {
            session.frame_num = 0;
            session.last_slot = None;
        }

        // The driver consumes the NAL with its start code.
        let mut coded = Vec::with_capacity(slice.len() + 4);
        coded.extend_from_slice(&[0, 0, 0, 1]);
        coded.extend_from_slice(slice);
        let limits = session.session.limits();
        let aligned =
            (coded.len() as u64).next_multiple_of(limits.min_bitstream_size_alignment.max(1));
        session.bitstream.write(&coded)?;

        let slot = session.slot;
        let dst = &session.dpb[slot];

        session.commands.begin()?;
        let cb = session.commands.buffer();

        transition_image(
            &device,
            cb,
            dst.image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
        );

        // Picture resources for the setup slot and the reference slot.
        let dst_resource = vk::VideoPictureResourceInfoKHR::default()
            .image_view_binding(dst.view())
            .coded_extent(session.session.coded_extent())
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .base_array_layer(0);

        let reference = session
            .last_slot
            .filter(|_| !idr)
            .map(|prev| {
                let resource = vk::VideoPictureResourceInfoKHR::default()
                    .image_view_binding(session.dpb[prev].view())
                    .coded_extent(session.session.coded_extent())
                    .coded_offset(vk::Offset2D { x: 0, y: 0 })
                    .base_array_layer(0);
                (prev, resource)
            });

        // Slots bound for this coding scope: the setup slot (inactive
        // until the decode activates it) plus the active reference.
        let mut begin_slots = vec![vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(-1)
            .picture_resource(&dst_resource)];
        let mut ref_std: vk::native::StdVideoDecodeH264ReferenceInfo =
            unsafe { std::mem::zeroed() };
        let mut ref_h264_begin;
        let mut ref_h264_decode;
        let mut ref_slots = Vec::new();
        if let Some((prev, ref resource)) = reference {
            ref_std.FrameNum = session.frame_num.wrapping_sub(1) as u16;
            ref_h264_begin =
                vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(&ref_std);
            ref_h264_decode =
                vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(&ref_std);
            begin_slots.push(
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(prev as i32)
                    .picture_resource(resource)
                    .push_next(&mut ref_h264_begin),
            );
            ref_slots.push(
                // Same slot, re-declared as an active decode reference.
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(prev as i32)
                    .picture_resource(resource)
                    .push_next(&mut ref_h264_decode),
            );
        }

        let begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(session.session.handle())
            .video_session_parameters(session.parameters.handle())
            .reference_slots(&begin_slots);
        unsafe {
            (session.session.video_fp().cmd_begin_video_coding_khr)(cb, &begin_info);
        }

        if session.needs_reset {
            let control = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::RESET);
            unsafe {
                (session.session.video_fp().cmd_control_video_coding_khr)(cb, &control);
            }
            session.needs_reset = false;
        }

        // Std picture info for the slice being decoded.
        let mut std_picture: vk::native::StdVideoDecodeH264PictureInfo =
            unsafe { std::mem::zeroed() };
        if idr {
            std_picture.flags.set_IdrPicFlag(1);
            std_picture.flags.set_is_intra(1);
        }
        std_picture.flags.set_is_reference(1);
        std_picture.seq_parameter_set_id = sps.sps_id;
        std_picture.pic_parameter_set_id = pps.pps_id;
        std_picture.frame_num = session.frame_num as u16;
        std_picture.PicOrderCnt = [2 * session.frame_num as i32, 2 * session.frame_num as i32];

        let slice_offsets = [0u32];
        let mut h264_info =
            vk::VideoDecodeH264PictureInfoKHR::default().std_picture_info(&std_picture);
        h264_info.slice_count = 1;
        h264_info.p_slice_offsets = slice_offsets.as_ptr();

        let setup_slot = vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(slot as i32)
            .picture_resource(&dst_resource);

        let mut decode_info = vk::VideoDecodeInfoKHR::default()
            .src_buffer(session.bitstream.buffer())
            .src_buffer_offset(0)
            .src_buffer_range(aligned.min(session.bitstream.size()))
            .dst_picture_resource(dst_resource)
            .setup_reference_slot(&setup_slot)
            .push_next(&mut h264_info);
        if !ref_slots.is_empty() {
            decode_info = decode_info.reference_slots(&ref_slots);
        }

        unsafe {
            (session.decode_fp.cmd_decode_video_khr)(cb, &decode_info);
            let end_info = vk::VideoEndCodingInfoKHR::default();
            (session.session.video_fp().cmd_end_video_coding_khr)(cb, &end_info);
        }

        // Read the decoded picture back for conversion and delivery.
        transition_image(
            &device,
            cb,
            dst.image(),
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        let regions = nv12_copy_regions(session.width, session.height);
        unsafe {
            device.cmd_copy_image_to_buffer(
                cb,
                dst.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                session.readback.buffer(),
                &regions,
            );
        }
        // The slot stays referenceable for the next picture.
        transition_image(
            &device,
            cb,
            dst.image(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
        );

        session.commands.submit(session.queue)?;

        session.last_slot = Some(slot);
        session.slot = (slot + 1) % session.dpb.len();
        session.frame_num = session.frame_num.wrapping_add(1);
        Ok(())
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

    pub(crate) fn poll_frame(&mut self) -> Result<Option<DecodedOutput>> {
        if let Some(out) = self.pending.take() {
            return Ok(Some(out));
        }
        let Some(frame) = self.in_flight.take() else {
            return Ok(None);
        };
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::SessionFailed("poll without session".into()))?;

        let nv12_len = PixelFormat::Nv12.buffer_size(frame.width, frame.height);
        self.scratch.clear();
        self.scratch
            .extend_from_slice(session.readback.read(0, nv12_len));

        let format = self.desc.surface_format;
        let target = TextureDescriptor {
            width: frame.width,
            height: frame.height,
            format,
        };
        self.ring
            .ensure_with(target, |d| Ok(vec![0u8; d.format.buffer_size(d.width, d.height)]))?;
        self.ring.advance();
        let texture = self
            .ring
            .current_mut()
            .ok_or_else(|| Error::InvalidData("output ring empty after ensure".into()))?;
        match format {
            PixelFormat::Bgra => {
                self.converter
                    .nv12_to_bgra(frame.width, frame.height, &self.scratch, texture)?;
            }
            PixelFormat::Nv12 => texture.copy_from_slice(&self.scratch),
            other => return Err(Error::Unsupported(format!("output format {other:?}"))),
        }

        Ok(Some(DecodedOutput {
            width: frame.width,
            height: frame.height,
            format,
            keyframe: frame.keyframe,
            pts: frame.pts,
        }))
    }

    pub(crate) fn current_texture(&self) -> Result<&[u8]> {
        self.ring
            .current()
            .map(|v| v.as_slice())
            .ok_or_else(|| Error::InvalidData("no decoded texture yet".into()))
    }

    pub(crate) fn export_shared_handle(&self) -> Result<OwnedFd> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::InvalidData("no decoded texture yet".into()))?;
        let slot = session
            .last_slot
            .ok_or_else(|| Error::InvalidData("no decoded texture yet".into()))?;
        session.dpb[slot].export_fd(vulkan_ctx(&self.device))
    }

    pub(crate) fn close(&mut self) {
        self.session = None;
        self.in_flight = None;
        self.pending = None;
        self.closed = true;
    }
}
