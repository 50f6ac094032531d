//! Decoder sessions.
//!
//! A [`Decoder`] turns compressed packets into device textures. Each
//! accepted packet produces exactly one frame, converted into the output
//! ring and handed to the caller's callback before `decode` returns. The
//! texture borrow ends with the callback; a consumer that needs the
//! pixels longer takes a shared handle.

use crate::backend::{BackendKind, DecodeComponent, FaultInjection};
use crate::device::{AdapterId, DeviceHandle};
use crate::error::Result;
use crate::format::{Codec, CodecDescriptor, ColorMatrix, ColorRange, Direction, PixelFormat, MAX_GOP};
use crate::observability::{self, SessionMetrics};
use crate::retry::{RetryPolicy, SubmitStatus, SyncPolicy};
use crate::session::{SessionLifecycle, SessionState};
use crate::surface::SurfacePool;

use std::os::fd::OwnedFd;

/// Metadata of one decoded frame, produced by the backend component.
#[derive(Debug, Clone, Copy)]
pub struct DecodedOutput {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Format of the output texture.
    pub format: PixelFormat,
    /// Whether the source packet was a keyframe.
    pub keyframe: bool,
    /// Presentation timestamp from the bitstream.
    pub pts: i64,
}

/// A decoded frame, borrowed for the duration of the callback.
pub struct DecodedFrame<'a> {
    output: DecodedOutput,
    texture: &'a [u8],
    component: &'a DecodeComponent,
}

impl DecodedFrame<'_> {
    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.output.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.output.height
    }

    /// Output texture format.
    pub fn format(&self) -> PixelFormat {
        self.output.format
    }

    /// Whether the source packet was a keyframe.
    pub fn keyframe(&self) -> bool {
        self.output.keyframe
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> i64 {
        self.output.pts
    }

    /// Converted texture bytes. Valid until the callback returns; the
    /// ring overwrites this slot after `ring_depth - 1` further frames.
    pub fn texture(&self) -> &[u8] {
        self.texture
    }

    /// Export an OS handle to the texture for another device binding.
    ///
    /// The handle is a duplicated descriptor; the mapped contents are a
    /// stable snapshot on the software backend only until the ring slot
    /// is rotated back to.
    pub fn export_shared_handle(&self) -> Result<OwnedFd> {
        self.component.export_shared_handle()
    }
}

/// Decoder construction parameters.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Backend to use.
    pub backend: BackendKind,
    /// Adopt this existing device instead of creating one.
    pub device: Option<DeviceHandle>,
    /// Adapter to create the device on (ignored when adopting).
    pub adapter: Option<AdapterId>,
    /// Compressed input format.
    pub codec: Codec,
    /// Output texture format ([`PixelFormat::Bgra`] or [`PixelFormat::Nv12`]).
    pub output_format: PixelFormat,
    /// Color matrix for YUV → RGB conversion.
    pub matrix: ColorMatrix,
    /// Quantization range of the bitstream's YUV samples.
    pub range: ColorRange,
    /// Deterministic fault injection (software backend only).
    pub fault: FaultInjection,
}

impl DecoderConfig {
    /// BGRA-output defaults for `codec`.
    pub fn new(codec: Codec) -> Self {
        Self {
            backend: BackendKind::Software,
            device: None,
            adapter: None,
            codec,
            output_format: PixelFormat::Bgra,
            matrix: ColorMatrix::default(),
            range: ColorRange::default(),
            fault: FaultInjection::default(),
        }
    }

    fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor {
            direction: Direction::Decode,
            codec: self.codec,
            surface_format: self.output_format,
            // Geometry is learned from the bitstream; placeholders keep
            // the descriptor valid until the first frame.
            width: 2,
            height: 2,
            bitrate_kbps: 0,
            framerate: 30,
            gop: MAX_GOP,
            qp: None,
            matrix: self.matrix,
            range: self.range,
        }
    }
}

/// A live decoder session. `Send` but not `Sync`; one thread submits.
#[derive(Debug)]
pub struct Decoder {
    lifecycle: SessionLifecycle,
    component: DecodeComponent,
    pool: SurfacePool,
    device: DeviceHandle,
    codec: Codec,
    output_format: PixelFormat,
    retry: RetryPolicy,
    sync: SyncPolicy,
    metrics: SessionMetrics,
    span: tracing::Span,
    packets_in: u64,
    frames_out: u64,
}

impl Decoder {
    /// Create and fully initialize a decoder session.
    pub fn new(config: DecoderConfig) -> Result<Decoder> {
        let desc = config.descriptor();

        let mut lifecycle = SessionLifecycle::new("decoder");
        let device = DeviceHandle::bind(config.backend, config.adapter, config.device.as_ref())?;
        lifecycle.advance(SessionState::DeviceBound)?;

        let (component, negotiated) = DecodeComponent::create(&device, &desc, config.fault)?;
        lifecycle.advance(SessionState::ComponentReady)?;
        lifecycle.advance(SessionState::Configured)?;

        // Pool geometry comes from the negotiated descriptor; decode
        // surfaces themselves are NV12 reference targets regardless of
        // the converted output format.
        let desc = negotiated.descriptor;
        let pool = SurfacePool::new(
            negotiated.suggested_surfaces,
            desc.width,
            desc.height,
            PixelFormat::Nv12,
        )?;
        lifecycle.advance(SessionState::Initialized)?;
        lifecycle.advance(SessionState::Running)?;

        let span = observability::span_session("decode", &config.codec.to_string());
        span.in_scope(|| {
            tracing::info!(codec = %config.codec, output = ?config.output_format, "decoder session running");
        });

        Ok(Decoder {
            lifecycle,
            component,
            pool,
            device,
            codec: config.codec,
            output_format: config.output_format,
            retry: RetryPolicy::default(),
            sync: SyncPolicy::default(),
            metrics: SessionMetrics::new("decode"),
            span,
            packets_in: 0,
            frames_out: 0,
        })
    }

    /// Decode one compressed packet, dispatching the produced frame to
    /// `on_frame` on this thread before returning.
    ///
    /// Returns the number of frames dispatched: one per accepted packet,
    /// zero for packets that only feed the component (headers).
    pub fn decode<F>(&mut self, packet: &[u8], mut on_frame: F) -> Result<u32>
    where
        F: FnMut(&DecodedFrame<'_>),
    {
        let _span = self.span.enter();
        self.lifecycle.ensure_running()?;

        let surface = self.pool.acquire()?;

        let submit = self
            .retry
            .run(|| self.component.submit(packet, &surface));
        let status = match submit {
            Ok(s) => s,
            Err(e) => {
                self.pool.release(surface.index);
                if e.is_fatal() {
                    self.lifecycle.fail();
                }
                observability::trace_frame_error("decoder", &e);
                return Err(e);
            }
        };
        self.metrics.record_in();
        observability::record_frame_submitted("decode");
        self.packets_in += 1;

        if status == SubmitStatus::NeedMoreInput {
            self.pool.release(surface.index);
            return Ok(0);
        }

        // The conversion write must be complete before the callback can
        // observe the texture.
        if let Err(e) = self.sync.wait(|| self.component.sync_done()) {
            self.pool.release(surface.index);
            if e.is_fatal() {
                self.lifecycle.fail();
            }
            return Err(e);
        }

        let output = self.component.poll_frame()?;
        self.pool.release(surface.index);

        match output {
            Some(output) => {
                let frame = DecodedFrame {
                    output,
                    texture: self.component.current_texture()?,
                    component: &self.component,
                };
                self.metrics.record_out();
                observability::record_packet_produced("decode");
                self.frames_out += 1;
                on_frame(&frame);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Tear the session down in reverse acquisition order. Idempotent.
    pub fn close(&mut self) {
        if self.lifecycle.close() {
            self.component.close();
            self.pool.release_all();
            tracing::info!(
                packets_in = self.packets_in,
                frames_out = self.frames_out,
                "decoder session closed"
            );
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Session codec.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Output texture format.
    pub fn output_format(&self) -> PixelFormat {
        self.output_format
    }

    /// The device this session runs on.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Surface pool capacity (includes the backend's safety margin).
    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Packets accepted so far.
    pub fn packets_in(&self) -> u64 {
        self.packets_in
    }

    /// Frames delivered so far.
    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft;
    use crate::error::Error;

    fn gradient_nv12(width: u32, height: u32) -> Vec<u8> {
        let mut buf = vec![128u8; PixelFormat::Nv12.buffer_size(width, height)];
        for row in 0..height as usize {
            for col in 0..width as usize {
                buf[row * width as usize + col] = ((row + col) * 8 % 256) as u8;
            }
        }
        buf
    }

    #[test]
    fn decode_delivers_one_frame_per_packet() {
        let mut dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();
        let nv12 = gradient_nv12(32, 32);
        let mut frames = 0;
        for pts in 0..4 {
            let pkt =
                soft::raw_frame_packet(Codec::H264, 32, 32, pts, pts == 0, &nv12).unwrap();
            let n = dec
                .decode(&pkt, |f| {
                    frames += 1;
                    assert_eq!((f.width(), f.height()), (32, 32));
                    assert_eq!(f.texture().len(), 32 * 32 * 4);
                    assert_eq!(f.pts(), pts);
                })
                .unwrap();
            assert_eq!(n, 1);
        }
        assert_eq!(frames, 4);
        assert_eq!(dec.frames_out(), 4);
    }

    #[test]
    fn garbage_input_is_per_frame_error() {
        let mut dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();
        assert!(matches!(
            dec.decode(b"garbage", |_| {}),
            Err(Error::InvalidData(_))
        ));
        // Session survives; a good packet still decodes.
        assert_eq!(dec.state(), SessionState::Running);
        let nv12 = gradient_nv12(16, 16);
        let pkt = soft::raw_frame_packet(Codec::H264, 16, 16, 0, true, &nv12).unwrap();
        assert_eq!(dec.decode(&pkt, |_| {}).unwrap(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let mut dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();
        dec.close();
        dec.close();
        assert_eq!(dec.state(), SessionState::Closed);
        assert!(dec.decode(&[0u8; 4], |_| {}).is_err());
    }

    #[test]
    fn pool_includes_margin() {
        let dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();
        assert_eq!(dec.pool_capacity(), 5);
    }

    #[test]
    fn nv12_passthrough_output() {
        let mut cfg = DecoderConfig::new(Codec::H264);
        cfg.output_format = PixelFormat::Nv12;
        let mut dec = Decoder::new(cfg).unwrap();
        let nv12 = gradient_nv12(16, 16);
        let pkt = soft::raw_frame_packet(Codec::H264, 16, 16, 0, true, &nv12).unwrap();
        dec.decode(&pkt, |f| {
            assert_eq!(f.format(), PixelFormat::Nv12);
            assert_eq!(f.texture(), &nv12[..]);
        })
        .unwrap();
    }
}
