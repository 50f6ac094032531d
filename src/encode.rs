//! Encoder sessions.
//!
//! An [`Encoder`] drives one hardware (or software) encode component
//! through the session lifecycle. Frames go in one at a time on a single
//! thread; each accepted frame produces exactly one packet, delivered to
//! the caller's callback before `encode` returns.

use crate::backend::{
    BackendKind, EncodeComponent, FaultInjection, Property, PropertyOutcome,
};
use crate::device::{AdapterId, DeviceHandle};
use crate::error::{Error, Result};
use crate::format::{
    Codec, CodecDescriptor, ColorMatrix, ColorRange, Direction, PixelFormat, QpRange, MAX_GOP,
};
use crate::observability::{self, SessionMetrics};
use crate::retry::{RetryPolicy, SubmitStatus, SyncPolicy};
use crate::session::{SessionLifecycle, SessionState};
use crate::surface::SurfacePool;

use bytes::Bytes;

/// One encoded bitstream packet.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Compressed payload.
    pub data: Bytes,
    /// Presentation timestamp, echoed from the input frame.
    pub pts: i64,
    /// Whether this packet is an IDR/keyframe.
    pub keyframe: bool,
}

/// Encoder construction parameters.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Backend to use.
    pub backend: BackendKind,
    /// Adopt this existing device instead of creating one.
    pub device: Option<DeviceHandle>,
    /// Adapter to create the device on (ignored when adopting).
    pub adapter: Option<AdapterId>,
    /// Compressed output format.
    pub codec: Codec,
    /// Input surface format ([`PixelFormat::Nv12`] or [`PixelFormat::Bgra`]).
    pub input_format: PixelFormat,
    /// Frame width. Must be even.
    pub width: u32,
    /// Frame height. Must be even.
    pub height: u32,
    /// Target bitrate in kilobits per second.
    pub bitrate_kbps: u32,
    /// Target framerate in frames per second.
    pub framerate: u32,
    /// Keyframe interval; [`MAX_GOP`] for no periodic keyframes.
    pub gop: u32,
    /// Optional QP bounds.
    pub qp: Option<QpRange>,
    /// Color matrix for RGB → YUV input conversion.
    pub matrix: ColorMatrix,
    /// Quantization range of the produced YUV samples.
    pub range: ColorRange,
    /// Deterministic fault injection (software backend only).
    pub fault: FaultInjection,
}

impl EncoderConfig {
    /// Low-latency defaults for `codec` at the given geometry.
    pub fn new(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            backend: BackendKind::Software,
            device: None,
            adapter: None,
            codec,
            input_format: PixelFormat::Nv12,
            width,
            height,
            bitrate_kbps: 2000,
            framerate: 30,
            gop: MAX_GOP,
            qp: None,
            matrix: ColorMatrix::default(),
            range: ColorRange::default(),
            fault: FaultInjection::default(),
        }
    }

    fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor {
            direction: Direction::Encode,
            codec: self.codec,
            surface_format: self.input_format,
            width: self.width,
            height: self.height,
            bitrate_kbps: self.bitrate_kbps,
            framerate: self.framerate,
            gop: self.gop,
            qp: self.qp,
            matrix: self.matrix,
            range: self.range,
        }
    }
}

/// A live encoder session.
///
/// `Send` but not `Sync`: one thread submits at a time. Dropping the
/// session closes it.
#[derive(Debug)]
pub struct Encoder {
    lifecycle: SessionLifecycle,
    component: EncodeComponent,
    pool: SurfacePool,
    desc: CodecDescriptor,
    device: DeviceHandle,
    retry: RetryPolicy,
    sync: SyncPolicy,
    metrics: SessionMetrics,
    span: tracing::Span,
    force_idr: bool,
    frames_in: u64,
    packets_out: u64,
}

impl Encoder {
    /// Create and fully initialize an encoder session.
    ///
    /// Either returns a session in the running state or an error with
    /// everything already released; no half-constructed session exists.
    pub fn new(config: EncoderConfig) -> Result<Encoder> {
        let desc = config.descriptor();
        desc.validate()?;

        let mut lifecycle = SessionLifecycle::new("encoder");
        let device = DeviceHandle::bind(config.backend, config.adapter, config.device.as_ref())?;
        lifecycle.advance(SessionState::DeviceBound)?;

        let (component, negotiated) = EncodeComponent::create(&device, &desc, config.fault)?;
        lifecycle.advance(SessionState::ComponentReady)?;

        let desc = negotiated.descriptor;
        if desc.surface_format != config.input_format {
            return Err(Error::Incompatible(format!(
                "component adjusted input format to {:?}",
                desc.surface_format
            )));
        }
        lifecycle.advance(SessionState::Configured)?;

        let pool = SurfacePool::new(
            negotiated.suggested_surfaces,
            desc.width,
            desc.height,
            desc.surface_format,
        )?;
        lifecycle.advance(SessionState::Initialized)?;
        lifecycle.advance(SessionState::Running)?;

        let span = observability::span_session("encode", &desc.codec.to_string());
        span.in_scope(|| {
            tracing::info!(
                codec = %desc.codec,
                width = desc.width,
                height = desc.height,
                bitrate_kbps = desc.bitrate_kbps,
                "encoder session running"
            );
        });

        Ok(Encoder {
            lifecycle,
            component,
            pool,
            desc,
            device,
            retry: RetryPolicy::default(),
            sync: SyncPolicy::default(),
            metrics: SessionMetrics::new("encode"),
            span,
            force_idr: false,
            frames_in: 0,
            packets_out: 0,
        })
    }

    /// Encode one frame, dispatching the produced packet to `on_packet`
    /// on this thread before returning.
    ///
    /// Returns the number of packets dispatched (one, for every
    /// low-latency configuration). The packet borrow is only valid for
    /// the duration of the callback; clone `data` to keep it.
    pub fn encode<F>(&mut self, frame: &[u8], pts: i64, mut on_packet: F) -> Result<u32>
    where
        F: FnMut(&EncodedPacket),
    {
        let _span = self.span.enter();
        self.lifecycle.ensure_running()?;

        let surface = self.pool.acquire()?;
        let force_idr = std::mem::take(&mut self.force_idr);

        let submit = self.retry.run(|| {
            self.component.submit(&surface, frame, pts, force_idr)
        });
        let status = match submit {
            Ok(s) => s,
            Err(e) => {
                self.pool.release(surface.index);
                if e.is_fatal() {
                    self.lifecycle.fail();
                }
                observability::trace_frame_error("encoder", &e);
                return Err(e);
            }
        };
        self.metrics.record_in();
        observability::record_frame_submitted("encode");
        self.frames_in += 1;

        if status == SubmitStatus::NeedMoreInput {
            self.pool.release(surface.index);
            return Ok(0);
        }

        if let Err(e) = self.sync.wait(|| self.component.sync_done()) {
            self.pool.release(surface.index);
            if e.is_fatal() {
                self.lifecycle.fail();
            }
            return Err(e);
        }

        let packet = self.component.poll_packet()?;
        self.pool.release(surface.index);

        match packet {
            Some(packet) => {
                self.metrics.record_out();
                observability::record_packet_produced("encode");
                self.packets_out += 1;
                on_packet(&packet);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Force the next frame to be encoded as an IDR.
    pub fn request_keyframe(&mut self) {
        self.force_idr = true;
    }

    /// Change the target bitrate mid-stream.
    pub fn set_bitrate(&mut self, kbps: u32) -> Result<()> {
        if kbps == 0 {
            return Err(Error::InvalidParameter("bitrate must be non-zero".into()));
        }
        self.reconfigure(Property::Bitrate(kbps))
    }

    /// Change the target framerate mid-stream.
    pub fn set_framerate(&mut self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(Error::InvalidParameter("framerate must be non-zero".into()));
        }
        self.reconfigure(Property::Framerate(fps))
    }

    /// Change the QP bounds mid-stream.
    pub fn set_qp(&mut self, min: u8, max: u8) -> Result<()> {
        let range = QpRange { min, max };
        range.validate()?;
        self.reconfigure(Property::Qp(range))
    }

    /// Validate, then apply a property in place or via snapshot-reset.
    ///
    /// Validation failures return before any state is touched. A failed
    /// reset leaves the session failed, never silently reverted.
    fn reconfigure(&mut self, property: Property) -> Result<()> {
        let _span = self.span.enter();
        self.lifecycle.ensure_running()?;
        self.lifecycle.advance(SessionState::Reconfiguring)?;

        let outcome = match self.component.try_set_property(property) {
            Ok(o) => o,
            Err(e) => {
                self.lifecycle.fail();
                return Err(e);
            }
        };

        if outcome == PropertyOutcome::NeedsReset {
            let mut snapshot = self.desc.clone();
            apply_property(&mut snapshot, property);
            if let Err(e) = self.component.reset(&snapshot) {
                self.lifecycle.fail();
                tracing::warn!(error = %e, "component reset failed; session failed");
                return Err(Error::SessionFailed(format!(
                    "reset for {} change failed: {e}",
                    property.name()
                )));
            }
        }

        apply_property(&mut self.desc, property);
        observability::record_reconfigure(property.name());
        self.lifecycle.advance(SessionState::Running)?;
        tracing::debug!(property = property.name(), "reconfigured");
        Ok(())
    }

    /// Tear the session down: component, then pools, then the device
    /// reference, in reverse acquisition order. Idempotent.
    pub fn close(&mut self) {
        if self.lifecycle.close() {
            self.component.close();
            self.pool.release_all();
            tracing::info!(
                frames_in = self.frames_in,
                packets_out = self.packets_out,
                "encoder session closed"
            );
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Current descriptor (reflects applied reconfigurations).
    pub fn descriptor(&self) -> &CodecDescriptor {
        &self.desc
    }

    /// The device this session runs on.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Surface pool capacity.
    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Surface pool identity; unchanged across reconfiguration.
    pub fn pool_generation(&self) -> u64 {
        self.pool.generation()
    }

    /// Frames accepted so far.
    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    /// Packets delivered so far.
    pub fn packets_out(&self) -> u64 {
        self.packets_out
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn apply_property(desc: &mut CodecDescriptor, property: Property) {
    match property {
        Property::Bitrate(kbps) => desc.bitrate_kbps = kbps,
        Property::Framerate(fps) => desc.framerate = fps,
        Property::Qp(range) => desc.qp = Some(range),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EncoderConfig {
        EncoderConfig::new(Codec::H264, 64, 64)
    }

    fn frame() -> Vec<u8> {
        vec![0u8; PixelFormat::Nv12.buffer_size(64, 64)]
    }

    #[test]
    fn construction_rejects_odd_dimensions() {
        let mut c = config();
        c.width = 63;
        assert!(matches!(
            Encoder::new(c),
            Err(Error::OddDimensions { .. })
        ));
    }

    #[test]
    fn one_packet_per_frame() {
        let mut enc = Encoder::new(config()).unwrap();
        let mut sizes = Vec::new();
        for pts in 0..5 {
            let n = enc
                .encode(&frame(), pts, |p| sizes.push(p.data.len()))
                .unwrap();
            assert_eq!(n, 1);
        }
        assert_eq!(sizes.len(), 5);
        assert!(sizes.iter().all(|&s| s > 0));
    }

    #[test]
    fn first_packet_is_keyframe() {
        let mut enc = Encoder::new(config()).unwrap();
        let mut keys = Vec::new();
        for pts in 0..3 {
            enc.encode(&frame(), pts, |p| keys.push(p.keyframe)).unwrap();
        }
        assert_eq!(keys, vec![true, false, false]);
    }

    #[test]
    fn request_keyframe_forces_idr() {
        let mut enc = Encoder::new(config()).unwrap();
        let mut keys = Vec::new();
        for pts in 0..2 {
            enc.encode(&frame(), pts, |p| keys.push(p.keyframe)).unwrap();
        }
        enc.request_keyframe();
        enc.encode(&frame(), 2, |p| keys.push(p.keyframe)).unwrap();
        enc.encode(&frame(), 3, |p| keys.push(p.keyframe)).unwrap();
        assert_eq!(keys, vec![true, false, true, false]);
    }

    #[test]
    fn set_qp_rejects_bad_range_without_touching_state() {
        let mut enc = Encoder::new(config()).unwrap();
        let before = enc.descriptor().clone();
        assert!(matches!(
            enc.set_qp(40, 10),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(enc.set_qp(0, 52), Err(Error::InvalidParameter(_))));
        assert_eq!(enc.state(), SessionState::Running);
        assert_eq!(enc.descriptor(), &before);

        // Valid range goes through the reset path and still runs after.
        enc.set_qp(10, 40).unwrap();
        assert_eq!(enc.state(), SessionState::Running);
        assert_eq!(enc.descriptor().qp, Some(QpRange { min: 10, max: 40 }));
        enc.encode(&frame(), 0, |_| {}).unwrap();
    }

    #[test]
    fn reconfigure_preserves_pool() {
        let mut enc = Encoder::new(config()).unwrap();
        let generation = enc.pool_generation();
        let capacity = enc.pool_capacity();
        enc.set_bitrate(4000).unwrap();
        enc.set_framerate(60).unwrap();
        enc.set_qp(5, 45).unwrap();
        assert_eq!(enc.pool_generation(), generation);
        assert_eq!(enc.pool_capacity(), capacity);
    }

    #[test]
    fn close_is_idempotent_and_blocks_frames() {
        let mut enc = Encoder::new(config()).unwrap();
        enc.close();
        assert_eq!(enc.state(), SessionState::Closed);
        enc.close();
        assert_eq!(enc.state(), SessionState::Closed);
        assert!(matches!(
            enc.encode(&frame(), 0, |_| {}),
            Err(Error::SessionFailed(_))
        ));
    }

    #[test]
    fn always_busy_stalls() {
        let mut c = config();
        c.fault.always_busy = true;
        let mut enc = Encoder::new(c).unwrap();
        // Shrink the quantum so the test runs fast; the ceiling is the
        // property under test.
        enc.retry.quantum = std::time::Duration::from_micros(10);
        let err = enc.encode(&frame(), 0, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Stall { retries: 100 }));
        // Stall is per-frame, not fatal.
        assert_eq!(enc.state(), SessionState::Running);
    }

    #[test]
    fn transient_busy_is_absorbed() {
        let mut c = config();
        c.fault.busy_per_frame = 3;
        let mut enc = Encoder::new(c).unwrap();
        enc.retry.quantum = std::time::Duration::from_micros(10);
        let n = enc.encode(&frame(), 0, |_| {}).unwrap();
        assert_eq!(n, 1);
    }
}
