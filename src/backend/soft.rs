//! Deterministic software backend.
//!
//! Always available, no GPU required. Textures are memfd-backed so shared
//! handles are real file descriptors another device binding can map, and
//! the encoder follows a deterministic rate model (packet size tracks
//! bitrate over framerate, keyframes cost a fixed multiple) so bitrate
//! and framerate changes are observable in tests. Conversion runs the
//! fixed-point matrices from [`crate::convert`] on the CPU.

use crate::backend::{FaultInjection, Negotiated, Property, PropertyOutcome};
use crate::convert::Converter;
use crate::decode::DecodedOutput;
use crate::device::{AdapterId, AdapterInfo, AdapterVendor, DeviceHandle, DeviceInner};
use crate::encode::EncodedPacket;
use crate::error::{Error, Result};
use crate::format::{Codec, CodecDescriptor, PixelFormat, MAX_GOP};
use crate::retry::SubmitStatus;
use crate::ring::{OutputRing, TextureDescriptor};
use crate::surface::Surface;

use bytes::Bytes;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Identity of the built-in software adapter.
pub const SOFT_ADAPTER: AdapterId = AdapterId(0x50F7_0001);

/// Decode surface pool size before the safety margin, matching the
/// reference count a 4:2:0 low-latency stream needs.
const DECODE_SURFACES: usize = 4;
/// Encode input slots: one in flight, one being filled.
const ENCODE_SURFACES: usize = 2;
/// Decode output ring depth.
const RING_DEPTH: usize = 4;

/// Enumerate the software backend's adapters.
pub fn enumerate_adapters() -> Vec<AdapterInfo> {
    vec![AdapterInfo {
        id: SOFT_ADAPTER,
        vendor: AdapterVendor::Software,
        description: "hwvideo software device".into(),
    }]
}

/// The software device context.
#[derive(Debug)]
pub struct SoftDevice {
    adapter: AdapterInfo,
    protected: bool,
}

impl SoftDevice {
    /// Create the device, optionally pinned to an adapter identity.
    pub(crate) fn create(adapter: Option<AdapterId>) -> Result<Self> {
        let info = enumerate_adapters()
            .into_iter()
            .find(|a| adapter.is_none() || adapter == Some(a.id))
            .ok_or(Error::AdapterNotFound(adapter.map(|a| a.0).unwrap_or(0)))?;
        Ok(Self {
            adapter: info,
            protected: true,
        })
    }

    pub(crate) fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub(crate) fn multithread_protected(&self) -> bool {
        self.protected
    }

    /// Map an exported texture handle and copy out its contents.
    pub(crate) fn open_shared(&self, fd: BorrowedFd<'_>, size: usize) -> Result<Vec<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, size) }.to_vec();
        unsafe {
            let _ = rustix::mm::munmap(ptr, size);
        }
        Ok(bytes)
    }
}

/// A device texture backed by anonymous shared memory.
#[derive(Debug)]
pub struct SharedTexture {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedTexture {
    /// Allocate a texture of `size` bytes.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter(
                "texture size must be greater than 0".into(),
            ));
        }
        let cname = CString::new(name).map_err(|e| Error::InvalidParameter(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd.as_fd(),
                0,
            )?
        };
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::InvalidData("mmap returned null".into()))?;
        Ok(Self { fd, ptr, len: size })
    }

    /// Texture contents.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable texture contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the texture is empty (never true for a live allocation).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Duplicate the backing fd for sharing with another device binding.
    pub fn export(&self) -> Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(self.fd.as_fd(), 0)?)
    }
}

impl Drop for SharedTexture {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// Safety: the mapping is exclusively owned; the fd is dup'd for sharing.
unsafe impl Send for SharedTexture {}
unsafe impl Sync for SharedTexture {}

// ---------------------------------------------------------------------------
// Bitstream framing
// ---------------------------------------------------------------------------

const MAGIC: [u8; 4] = *b"HVS1";
const HEADER_LEN: usize = 4 + 1 + 1 + 4 + 4 + 8 + 4;
const FLAG_KEYFRAME: u8 = 0b0000_0001;
const FLAG_RAW_PAYLOAD: u8 = 0b0000_0010;

fn codec_tag(codec: Codec) -> u8 {
    match codec {
        Codec::H264 => 0,
        Codec::Hevc => 1,
        Codec::Av1 => 2,
    }
}

fn codec_from_tag(tag: u8) -> Result<Codec> {
    match tag {
        0 => Ok(Codec::H264),
        1 => Ok(Codec::Hevc),
        2 => Ok(Codec::Av1),
        other => Err(Error::InvalidData(format!("unknown codec tag {other}"))),
    }
}

struct ParsedPacket<'a> {
    codec: Codec,
    keyframe: bool,
    raw_payload: bool,
    width: u32,
    height: u32,
    pts: i64,
    payload: &'a [u8],
}

fn write_header(
    buf: &mut Vec<u8>,
    codec: Codec,
    flags: u8,
    width: u32,
    height: u32,
    pts: i64,
    payload_len: u32,
) {
    buf.extend_from_slice(&MAGIC);
    buf.push(codec_tag(codec));
    buf.push(flags);
    buf.extend_from_slice(&width.to_le_bytes());
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&pts.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
}

fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>> {
    if data.len() < HEADER_LEN || data[..4] != MAGIC {
        return Err(Error::InvalidData("not a valid bitstream packet".into()));
    }
    let codec = codec_from_tag(data[4])?;
    let flags = data[5];
    let width = u32::from_le_bytes(data[6..10].try_into().unwrap());
    let height = u32::from_le_bytes(data[10..14].try_into().unwrap());
    let pts = i64::from_le_bytes(data[14..22].try_into().unwrap());
    let payload_len = u32::from_le_bytes(data[22..26].try_into().unwrap()) as usize;
    let payload = data
        .get(HEADER_LEN..HEADER_LEN + payload_len)
        .ok_or_else(|| Error::InvalidData("truncated packet payload".into()))?;
    Ok(ParsedPacket {
        codec,
        keyframe: flags & FLAG_KEYFRAME != 0,
        raw_payload: flags & FLAG_RAW_PAYLOAD != 0,
        width,
        height,
        pts,
        payload,
    })
}

/// Build a decodable packet carrying a raw NV12 frame.
///
/// This is the sample-bitstream generator for decode probing and tests.
pub fn raw_frame_packet(
    codec: Codec,
    width: u32,
    height: u32,
    pts: i64,
    keyframe: bool,
    nv12: &[u8],
) -> Result<Vec<u8>> {
    let expect = PixelFormat::Nv12.buffer_size(width, height);
    if nv12.len() < expect {
        return Err(Error::InvalidData(format!(
            "NV12 payload {} bytes, {width}x{height} needs {expect}",
            nv12.len()
        )));
    }
    let mut flags = FLAG_RAW_PAYLOAD;
    if keyframe {
        flags |= FLAG_KEYFRAME;
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + expect);
    write_header(&mut buf, codec, flags, width, height, pts, expect as u32);
    buf.extend_from_slice(&nv12[..expect]);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Fault injection plumbing shared by both components
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BusyGate {
    fault: FaultInjection,
    remaining: u32,
}

impl BusyGate {
    fn new(fault: FaultInjection) -> Self {
        Self {
            fault,
            remaining: fault.busy_per_frame,
        }
    }

    /// Returns true while the submit should report busy.
    fn busy(&mut self) -> bool {
        if self.fault.always_busy {
            return true;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        false
    }

    fn rearm(&mut self) {
        self.remaining = self.fault.busy_per_frame;
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Software encoder component.
#[derive(Debug)]
pub struct SoftEncoder {
    desc: CodecDescriptor,
    converter: Converter,
    gate: BusyGate,
    frame_index: u64,
    frames_since_idr: u32,
    pending: Option<EncodedPacket>,
    synced: bool,
    scratch: Vec<u8>,
    closed: bool,
}

impl SoftEncoder {
    pub(crate) fn create(
        device: &DeviceHandle,
        desc: &CodecDescriptor,
        fault: FaultInjection,
    ) -> Result<(Self, Negotiated)> {
        debug_assert!(matches!(&*device.inner, DeviceInner::Soft(_)));
        if desc.codec == Codec::Av1 {
            return Err(Error::Unsupported("AV1 encode".into()));
        }
        if !matches!(desc.surface_format, PixelFormat::Nv12 | PixelFormat::Bgra) {
            return Err(Error::Unsupported(format!(
                "encode input format {:?}",
                desc.surface_format
            )));
        }
        let negotiated = Negotiated {
            descriptor: desc.clone(),
            suggested_surfaces: ENCODE_SURFACES,
            ring_depth: crate::ring::MIN_RING,
        };
        let enc = Self {
            desc: desc.clone(),
            converter: Converter::new(desc.matrix, desc.range),
            gate: BusyGate::new(fault),
            frame_index: 0,
            frames_since_idr: 0,
            pending: None,
            synced: true,
            scratch: Vec::new(),
            closed: false,
        };
        Ok((enc, negotiated))
    }

    /// Deterministic packet size for the current parameters.
    fn model_packet_len(&self, keyframe: bool) -> usize {
        let base = (self.desc.bitrate_kbps as usize * 1000) / (8 * self.desc.framerate as usize);
        let base = base.max(HEADER_LEN + 16);
        if keyframe {
            base * 4
        } else {
            base
        }
    }

    pub(crate) fn submit(
        &mut self,
        surface: &Surface,
        frame: &[u8],
        pts: i64,
        force_idr: bool,
    ) -> Result<SubmitStatus> {
        if self.closed {
            return Err(Error::SessionFailed("encoder component closed".into()));
        }
        if self.gate.busy() {
            return Ok(SubmitStatus::Busy);
        }
        self.gate.rearm();

        if frame.len() < self.desc.frame_size() {
            return Err(Error::InvalidData(format!(
                "input frame {} bytes, descriptor needs {}",
                frame.len(),
                self.desc.frame_size()
            )));
        }

        // Input binding: BGRA surfaces are converted to NV12 before the
        // rate model runs, as the hardware path does on the device.
        if self.desc.surface_format == PixelFormat::Bgra {
            let nv12_len = PixelFormat::Nv12.buffer_size(self.desc.width, self.desc.height);
            self.scratch.resize(nv12_len, 0);
            self.converter
                .bgra_to_nv12(self.desc.width, self.desc.height, frame, &mut self.scratch)?;
        }

        let keyframe = force_idr
            || self.frames_since_idr == 0
            || (self.desc.gop != MAX_GOP && self.frames_since_idr >= self.desc.gop);
        if keyframe {
            self.frames_since_idr = 0;
        }
        self.frames_since_idr += 1;

        let total = self.model_packet_len(keyframe);
        let payload_len = total - HEADER_LEN;
        let mut buf = Vec::with_capacity(total);
        let mut flags = 0;
        if keyframe {
            flags |= FLAG_KEYFRAME;
        }
        write_header(
            &mut buf,
            self.desc.codec,
            flags,
            self.desc.width,
            self.desc.height,
            pts,
            payload_len as u32,
        );
        // Deterministic filler derived from the frame index.
        let mut state = self
            .frame_index
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(surface.index as u64);
        for _ in 0..payload_len {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            buf.push((state >> 56) as u8);
        }

        self.pending = Some(EncodedPacket {
            data: Bytes::from(buf),
            pts,
            keyframe,
        });
        self.frame_index += 1;
        self.synced = false;
        Ok(SubmitStatus::Accepted)
    }

    pub(crate) fn poll_packet(&mut self) -> Result<Option<EncodedPacket>> {
        Ok(self.pending.take())
    }

    pub(crate) fn sync_done(&mut self) -> Result<bool> {
        // One poll of simulated latency before the completion token signals.
        if self.synced {
            Ok(true)
        } else {
            self.synced = true;
            Ok(false)
        }
    }

    pub(crate) fn try_set_property(&mut self, property: Property) -> Result<PropertyOutcome> {
        match property {
            Property::Bitrate(kbps) => {
                self.desc.bitrate_kbps = kbps;
                Ok(PropertyOutcome::Applied)
            }
            Property::Framerate(fps) => {
                self.desc.framerate = fps;
                Ok(PropertyOutcome::Applied)
            }
            // QP bounds are baked into component init here, as on most
            // hardware encoders.
            Property::Qp(_) => Ok(PropertyOutcome::NeedsReset),
        }
    }

    pub(crate) fn reset(&mut self, desc: &CodecDescriptor) -> Result<()> {
        desc.validate()?;
        if desc.width != self.desc.width || desc.height != self.desc.height {
            return Err(Error::Incompatible(
                "reset cannot change dimensions".into(),
            ));
        }
        self.desc = desc.clone();
        self.pending = None;
        self.synced = true;
        // Reinitialized components start a fresh GOP.
        self.frames_since_idr = 0;
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.pending = None;
        self.closed = true;
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Software decoder component.
#[derive(Debug)]
pub struct SoftDecoder {
    desc: CodecDescriptor,
    converter: Converter,
    ring: OutputRing<SharedTexture>,
    gate: BusyGate,
    pending: Option<DecodedOutput>,
    synced: bool,
    closed: bool,
}

impl SoftDecoder {
    pub(crate) fn create(
        device: &DeviceHandle,
        desc: &CodecDescriptor,
        fault: FaultInjection,
    ) -> Result<(Self, Negotiated)> {
        debug_assert!(matches!(&*device.inner, DeviceInner::Soft(_)));
        if !matches!(desc.surface_format, PixelFormat::Nv12 | PixelFormat::Bgra) {
            return Err(Error::Unsupported(format!(
                "decode output format {:?}",
                desc.surface_format
            )));
        }
        let negotiated = Negotiated {
            descriptor: desc.clone(),
            // Reference surfaces plus one margin slot for the frame being
            // displayed while the next decodes.
            suggested_surfaces: DECODE_SURFACES + 1,
            ring_depth: RING_DEPTH,
        };
        let dec = Self {
            desc: desc.clone(),
            converter: Converter::new(desc.matrix, desc.range),
            ring: OutputRing::new(RING_DEPTH)?,
            gate: BusyGate::new(fault),
            pending: None,
            synced: true,
            closed: false,
        };
        Ok((dec, negotiated))
    }

    pub(crate) fn submit(&mut self, packet: &[u8], _surface: &Surface) -> Result<SubmitStatus> {
        if self.closed {
            return Err(Error::SessionFailed("decoder component closed".into()));
        }
        if self.gate.busy() {
            return Ok(SubmitStatus::Busy);
        }
        self.gate.rearm();

        let parsed = parse_packet(packet)?;
        if parsed.codec != self.desc.codec {
            return Err(Error::InvalidData(format!(
                "packet codec {} does not match session codec {}",
                parsed.codec, self.desc.codec
            )));
        }
        if !parsed.raw_payload {
            // Model packets carry no reconstructable pixels.
            return Ok(SubmitStatus::NeedMoreInput);
        }
        if parsed.width % 2 != 0 || parsed.height % 2 != 0 {
            return Err(Error::OddDimensions {
                width: parsed.width,
                height: parsed.height,
            });
        }
        // The header's payload length must agree with its geometry before
        // anything is allocated or written.
        let expect = PixelFormat::Nv12.buffer_size(parsed.width, parsed.height);
        if parsed.payload.len() != expect {
            return Err(Error::InvalidData(format!(
                "raw payload {} bytes, {}x{} needs {expect}",
                parsed.payload.len(),
                parsed.width,
                parsed.height
            )));
        }

        // Mid-stream resolution changes reallocate the whole ring once.
        let format = self.desc.surface_format;
        let target = TextureDescriptor {
            width: parsed.width,
            height: parsed.height,
            format,
        };
        let mut texture_seq = 0u32;
        self.ring.ensure_with(target, |d| {
            texture_seq += 1;
            SharedTexture::new(
                &format!("hwvideo-out-{}x{}-{texture_seq}", d.width, d.height),
                d.format.buffer_size(d.width, d.height),
            )
        })?;

        // Rotate before writing so the previously delivered texture
        // survives until the ring wraps.
        self.ring.advance();
        let converter = self.converter;
        let (width, height) = (parsed.width, parsed.height);
        let texture = self
            .ring
            .current_mut()
            .ok_or_else(|| Error::InvalidData("output ring empty after ensure".into()))?;
        match format {
            PixelFormat::Bgra => {
                converter.nv12_to_bgra(width, height, parsed.payload, texture.as_mut_slice())?;
            }
            PixelFormat::Nv12 => {
                texture.as_mut_slice().copy_from_slice(parsed.payload);
            }
            other => return Err(Error::Unsupported(format!("output format {other:?}"))),
        }

        self.pending = Some(DecodedOutput {
            width,
            height,
            format,
            keyframe: parsed.keyframe,
            pts: parsed.pts,
        });
        self.synced = false;
        Ok(SubmitStatus::Accepted)
    }

    pub(crate) fn poll_frame(&mut self) -> Result<Option<DecodedOutput>> {
        Ok(self.pending.take())
    }

    pub(crate) fn sync_done(&mut self) -> Result<bool> {
        if self.synced {
            Ok(true)
        } else {
            self.synced = true;
            Ok(false)
        }
    }

    pub(crate) fn current_texture(&self) -> Result<&[u8]> {
        self.ring
            .current()
            .map(|t| t.as_slice())
            .ok_or_else(|| Error::InvalidData("no decoded texture available".into()))
    }

    pub(crate) fn export_shared_handle(&self) -> Result<OwnedFd> {
        self.ring
            .current()
            .ok_or_else(|| Error::InvalidData("no decoded texture available".into()))?
            .export()
    }

    pub(crate) fn close(&mut self) {
        self.pending = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ColorMatrix, ColorRange, Direction, QpRange};

    fn device() -> DeviceHandle {
        DeviceHandle::bind(crate::backend::BackendKind::Software, None, None).unwrap()
    }

    fn encode_desc(width: u32, height: u32) -> CodecDescriptor {
        CodecDescriptor {
            direction: Direction::Encode,
            codec: Codec::H264,
            surface_format: PixelFormat::Nv12,
            width,
            height,
            bitrate_kbps: 2000,
            framerate: 30,
            gop: MAX_GOP,
            qp: None,
            matrix: ColorMatrix::default(),
            range: ColorRange::default(),
        }
    }

    fn decode_desc(width: u32, height: u32) -> CodecDescriptor {
        CodecDescriptor {
            direction: Direction::Decode,
            codec: Codec::H264,
            surface_format: PixelFormat::Bgra,
            width,
            height,
            bitrate_kbps: 0,
            framerate: 30,
            gop: MAX_GOP,
            qp: None,
            matrix: ColorMatrix::default(),
            range: ColorRange::default(),
        }
    }

    fn surface() -> Surface {
        Surface {
            index: 0,
            width: 64,
            height: 64,
            format: PixelFormat::Nv12,
        }
    }

    #[test]
    fn shared_texture_export_sees_writes() {
        let mut tex = SharedTexture::new("test-tex", 64).unwrap();
        tex.as_mut_slice().fill(0xAB);
        let fd = tex.export().unwrap();
        let dev = device();
        let bytes = dev.open_shared_handle(fd.as_fd(), 64).unwrap();
        assert_eq!(bytes, vec![0xAB; 64]);
    }

    #[test]
    fn packet_roundtrip() {
        let nv12 = vec![17u8; PixelFormat::Nv12.buffer_size(16, 16)];
        let pkt = raw_frame_packet(Codec::Hevc, 16, 16, 42, true, &nv12).unwrap();
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.codec, Codec::Hevc);
        assert!(parsed.keyframe);
        assert!(parsed.raw_payload);
        assert_eq!((parsed.width, parsed.height), (16, 16));
        assert_eq!(parsed.pts, 42);
        assert_eq!(parsed.payload, &nv12[..]);
    }

    #[test]
    fn garbage_packet_rejected() {
        assert!(parse_packet(b"nonsense").is_err());
        assert!(parse_packet(&[]).is_err());
    }

    #[test]
    fn encoder_packet_size_tracks_bitrate() {
        let dev = device();
        let (mut enc, _) =
            SoftEncoder::create(&dev, &encode_desc(64, 64), FaultInjection::default()).unwrap();
        let frame = vec![0u8; PixelFormat::Nv12.buffer_size(64, 64)];

        enc.submit(&surface(), &frame, 0, false).unwrap();
        let key = enc.poll_packet().unwrap().unwrap();
        assert!(key.keyframe);

        enc.submit(&surface(), &frame, 1, false).unwrap();
        let delta = enc.poll_packet().unwrap().unwrap();
        assert!(!delta.keyframe);
        assert_eq!(delta.data.len(), 2000 * 1000 / (8 * 30));
        assert_eq!(key.data.len(), delta.data.len() * 4);

        enc.try_set_property(Property::Bitrate(4000)).unwrap();
        enc.submit(&surface(), &frame, 2, false).unwrap();
        let bigger = enc.poll_packet().unwrap().unwrap();
        assert_eq!(bigger.data.len(), delta.data.len() * 2);
    }

    #[test]
    fn encoder_av1_unsupported() {
        let dev = device();
        let mut desc = encode_desc(64, 64);
        desc.codec = Codec::Av1;
        assert!(matches!(
            SoftEncoder::create(&dev, &desc, FaultInjection::default()),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn encoder_gop_schedule() {
        let dev = device();
        let mut desc = encode_desc(64, 64);
        desc.gop = 3;
        let (mut enc, _) = SoftEncoder::create(&dev, &desc, FaultInjection::default()).unwrap();
        let frame = vec![0u8; desc.frame_size()];
        let mut keys = Vec::new();
        for pts in 0..7 {
            enc.submit(&surface(), &frame, pts, false).unwrap();
            keys.push(enc.poll_packet().unwrap().unwrap().keyframe);
        }
        assert_eq!(keys, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn encoder_qp_needs_reset() {
        let dev = device();
        let (mut enc, _) =
            SoftEncoder::create(&dev, &encode_desc(64, 64), FaultInjection::default()).unwrap();
        let outcome = enc
            .try_set_property(Property::Qp(QpRange { min: 10, max: 40 }))
            .unwrap();
        assert_eq!(outcome, PropertyOutcome::NeedsReset);

        let mut snapshot = encode_desc(64, 64);
        snapshot.qp = Some(QpRange { min: 10, max: 40 });
        enc.reset(&snapshot).unwrap();
    }

    #[test]
    fn encoder_reset_rejects_resize() {
        let dev = device();
        let (mut enc, _) =
            SoftEncoder::create(&dev, &encode_desc(64, 64), FaultInjection::default()).unwrap();
        let other = encode_desc(128, 128);
        assert!(matches!(enc.reset(&other), Err(Error::Incompatible(_))));
    }

    #[test]
    fn decoder_converts_and_exports() {
        let dev = device();
        let (mut dec, neg) =
            SoftDecoder::create(&dev, &decode_desc(16, 16), FaultInjection::default()).unwrap();
        assert_eq!(neg.suggested_surfaces, DECODE_SURFACES + 1);

        // Mid-gray NV12 frame.
        let mut nv12 = vec![128u8; PixelFormat::Nv12.buffer_size(16, 16)];
        nv12[..16 * 16].fill(200);
        let pkt = raw_frame_packet(Codec::H264, 16, 16, 7, true, &nv12).unwrap();

        let status = dec.submit(&pkt, &surface()).unwrap();
        assert_eq!(status, SubmitStatus::Accepted);
        let out = dec.poll_frame().unwrap().unwrap();
        assert_eq!((out.width, out.height), (16, 16));
        assert!(out.keyframe);
        assert_eq!(out.pts, 7);

        let tex = dec.current_texture().unwrap();
        assert_eq!(tex.len(), 16 * 16 * 4);
        // Neutral chroma: B == G == R.
        assert_eq!(tex[0], tex[1]);
        assert_eq!(tex[1], tex[2]);
        assert_eq!(tex[3], 255);

        let fd = dec.export_shared_handle().unwrap();
        let shared = dev.open_shared_handle(fd.as_fd(), tex.len()).unwrap();
        assert_eq!(shared, tex);
    }

    #[test]
    fn decoder_resolution_change_keeps_working() {
        let dev = device();
        let (mut dec, _) =
            SoftDecoder::create(&dev, &decode_desc(16, 16), FaultInjection::default()).unwrap();

        let small = vec![100u8; PixelFormat::Nv12.buffer_size(16, 16)];
        let pkt = raw_frame_packet(Codec::H264, 16, 16, 0, true, &small).unwrap();
        dec.submit(&pkt, &surface()).unwrap();
        dec.poll_frame().unwrap().unwrap();

        let big = vec![100u8; PixelFormat::Nv12.buffer_size(32, 32)];
        let pkt = raw_frame_packet(Codec::H264, 32, 32, 1, true, &big).unwrap();
        dec.submit(&pkt, &surface()).unwrap();
        let out = dec.poll_frame().unwrap().unwrap();
        assert_eq!((out.width, out.height), (32, 32));
        assert_eq!(dec.current_texture().unwrap().len(), 32 * 32 * 4);
    }

    #[test]
    fn decoder_rejects_payload_length_mismatch() {
        let dev = device();
        let mut desc = decode_desc(16, 16);
        desc.surface_format = PixelFormat::Nv12;
        let (mut dec, _) = SoftDecoder::create(&dev, &desc, FaultInjection::default()).unwrap();

        // Well-formed header whose declared payload cannot cover a 16x16
        // NV12 frame.
        let mut pkt = Vec::new();
        write_header(
            &mut pkt,
            Codec::H264,
            FLAG_KEYFRAME | FLAG_RAW_PAYLOAD,
            16,
            16,
            0,
            10,
        );
        pkt.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            dec.submit(&pkt, &surface()),
            Err(Error::InvalidData(_))
        ));

        // Per-frame error: the session keeps decoding afterwards.
        let nv12 = vec![0u8; PixelFormat::Nv12.buffer_size(16, 16)];
        let good = raw_frame_packet(Codec::H264, 16, 16, 1, true, &nv12).unwrap();
        assert_eq!(
            dec.submit(&good, &surface()).unwrap(),
            SubmitStatus::Accepted
        );
    }

    #[test]
    fn decoder_codec_mismatch_rejected() {
        let dev = device();
        let (mut dec, _) =
            SoftDecoder::create(&dev, &decode_desc(16, 16), FaultInjection::default()).unwrap();
        let nv12 = vec![0u8; PixelFormat::Nv12.buffer_size(16, 16)];
        let pkt = raw_frame_packet(Codec::Hevc, 16, 16, 0, true, &nv12).unwrap();
        assert!(matches!(
            dec.submit(&pkt, &surface()),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn busy_gate_counts_down() {
        let dev = device();
        let fault = FaultInjection {
            always_busy: false,
            busy_per_frame: 2,
        };
        let (mut enc, _) = SoftEncoder::create(&dev, &encode_desc(64, 64), fault).unwrap();
        let frame = vec![0u8; PixelFormat::Nv12.buffer_size(64, 64)];
        assert_eq!(
            enc.submit(&surface(), &frame, 0, false).unwrap(),
            SubmitStatus::Busy
        );
        assert_eq!(
            enc.submit(&surface(), &frame, 0, false).unwrap(),
            SubmitStatus::Busy
        );
        assert_eq!(
            enc.submit(&surface(), &frame, 0, false).unwrap(),
            SubmitStatus::Accepted
        );
    }
}
