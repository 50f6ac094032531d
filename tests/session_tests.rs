//! Integration tests for encode and decode sessions.
//!
//! These tests drive complete sessions through the public API on the
//! software backend: lifecycle, callback delivery, reconfiguration,
//! backpressure, and shared-handle export across device bindings.

use hwvideo::backend::{BackendKind, FaultInjection};
use hwvideo::decode::{Decoder, DecoderConfig};
use hwvideo::device::DeviceHandle;
use hwvideo::encode::{Encoder, EncoderConfig};
use hwvideo::error::Error;
use hwvideo::format::{Codec, PixelFormat};
use hwvideo::probe;
use hwvideo::session::SessionState;

use std::os::fd::AsFd;

/// Test helper: an NV12 frame with a diagonal luma gradient.
fn gradient_nv12(width: u32, height: u32) -> Vec<u8> {
    let mut buf = vec![128u8; PixelFormat::Nv12.buffer_size(width, height)];
    for row in 0..height as usize {
        for col in 0..width as usize {
            buf[row * width as usize + col] = ((row * 3 + col * 5) % 256) as u8;
        }
    }
    buf
}

/// Test helper: a decodable raw-payload packet for the software backend.
fn raw_packet(codec: Codec, width: u32, height: u32, pts: i64, nv12: &[u8]) -> Vec<u8> {
    hwvideo::backend::soft::raw_frame_packet(codec, width, height, pts, true, nv12).unwrap()
}

/// Every accepted frame produces exactly one packet, dispatched before
/// `encode` returns, with pts echoed from the input.
#[test]
fn encode_session_delivers_one_packet_per_frame() {
    let mut enc = Encoder::new(EncoderConfig::new(Codec::H264, 128, 72)).unwrap();
    assert_eq!(enc.state(), SessionState::Running);

    let frame = gradient_nv12(128, 72);
    let mut seen = Vec::new();
    for pts in 0..10 {
        let n = enc.encode(&frame, pts, |p| seen.push((p.pts, p.keyframe))).unwrap();
        assert_eq!(n, 1);
    }
    assert_eq!(seen.len(), 10);
    assert!(seen[0].1, "first packet must be a keyframe");
    assert!(seen[1..].iter().all(|&(_, key)| !key));
    assert_eq!(seen.iter().map(|&(pts, _)| pts).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    assert_eq!(enc.frames_in(), 10);
    assert_eq!(enc.packets_out(), 10);
}

/// A GOP of one makes every packet a keyframe.
#[test]
fn gop_of_one_keyframes_every_packet() {
    let mut config = EncoderConfig::new(Codec::H264, 64, 64);
    config.gop = 1;
    let mut enc = Encoder::new(config).unwrap();
    let frame = gradient_nv12(64, 64);
    let mut keys = Vec::new();
    for pts in 0..6 {
        enc.encode(&frame, pts, |p| keys.push(p.keyframe)).unwrap();
    }
    assert_eq!(keys, vec![true; 6]);
}

/// Bitrate changes apply in place: packet sizes shift while the surface
/// pool identity and capacity are untouched.
#[test]
fn set_bitrate_shifts_packet_sizes_without_pool_churn() {
    let mut enc = Encoder::new(EncoderConfig::new(Codec::H264, 64, 64)).unwrap();
    let generation = enc.pool_generation();
    let capacity = enc.pool_capacity();
    let frame = gradient_nv12(64, 64);

    // Skip the keyframe, then sample a delta packet at each bitrate.
    enc.encode(&frame, 0, |_| {}).unwrap();
    let mut before = 0;
    enc.encode(&frame, 1, |p| before = p.data.len()).unwrap();

    enc.set_bitrate(4000).unwrap();
    assert_eq!(enc.state(), SessionState::Running);
    let mut after = 0;
    enc.encode(&frame, 2, |p| after = p.data.len()).unwrap();

    assert_eq!(after, before * 2);
    assert_eq!(enc.pool_generation(), generation);
    assert_eq!(enc.pool_capacity(), capacity);
}

/// Framerate changes are observable the same way: per-frame budget is
/// bitrate over framerate.
#[test]
fn set_framerate_shrinks_per_frame_budget() {
    let mut enc = Encoder::new(EncoderConfig::new(Codec::H264, 64, 64)).unwrap();
    let frame = gradient_nv12(64, 64);
    enc.encode(&frame, 0, |_| {}).unwrap();
    let mut at_30 = 0;
    enc.encode(&frame, 1, |p| at_30 = p.data.len()).unwrap();

    enc.set_framerate(60).unwrap();
    let mut at_60 = 0;
    enc.encode(&frame, 2, |p| at_60 = p.data.len()).unwrap();
    assert_eq!(at_60, at_30 / 2);
}

/// An invalid QP range is rejected up front and leaves the session
/// running with its configuration untouched.
#[test]
fn invalid_qp_range_leaves_session_untouched() {
    let mut enc = Encoder::new(EncoderConfig::new(Codec::H264, 64, 64)).unwrap();
    let before = enc.descriptor().clone();
    assert!(matches!(enc.set_qp(45, 12), Err(Error::InvalidParameter(_))));
    assert_eq!(enc.state(), SessionState::Running);
    assert_eq!(enc.descriptor(), &before);

    // The valid range goes through the snapshot-reset path and the
    // session keeps encoding.
    enc.set_qp(12, 45).unwrap();
    assert_eq!(enc.state(), SessionState::Running);
    enc.encode(&gradient_nv12(64, 64), 0, |_| {}).unwrap();
}

/// Odd dimensions never construct a session.
#[test]
fn odd_dimensions_rejected_at_construction() {
    let config = EncoderConfig::new(Codec::H264, 641, 480);
    assert!(matches!(
        Encoder::new(config),
        Err(Error::OddDimensions { width: 641, height: 480 })
    ));
}

/// Destroying a session twice is a no-op the second time, and further
/// submissions fail cleanly.
#[test]
fn double_close_is_idempotent() {
    let mut enc = Encoder::new(EncoderConfig::new(Codec::H264, 64, 64)).unwrap();
    enc.close();
    assert_eq!(enc.state(), SessionState::Closed);
    enc.close();
    assert_eq!(enc.state(), SessionState::Closed);
    assert!(enc.encode(&gradient_nv12(64, 64), 0, |_| {}).is_err());

    let mut dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();
    dec.close();
    dec.close();
    assert_eq!(dec.state(), SessionState::Closed);
}

/// A component that stays busy past the retry ceiling surfaces a stall,
/// which is a per-frame error: the session keeps running.
#[test]
fn persistent_busy_becomes_stall() {
    let mut config = EncoderConfig::new(Codec::H264, 64, 64);
    config.fault.always_busy = true;
    let mut enc = Encoder::new(config).unwrap();
    let err = enc.encode(&gradient_nv12(64, 64), 0, |_| {}).unwrap_err();
    assert!(matches!(err, Error::Stall { retries: 100 }));
    assert_eq!(enc.state(), SessionState::Running);
}

/// Transient busy responses are absorbed by the retry policy and the
/// frame still produces its packet.
#[test]
fn transient_busy_is_retried() {
    let mut config = EncoderConfig::new(Codec::H264, 64, 64);
    config.fault.busy_per_frame = 5;
    let mut enc = Encoder::new(config).unwrap();
    let n = enc.encode(&gradient_nv12(64, 64), 0, |_| {}).unwrap();
    assert_eq!(n, 1);
}

/// Decode delivers the converted texture to the callback; the same bytes
/// are reachable through an exported handle opened on another binding of
/// the device.
#[test]
fn shared_handle_roundtrip_across_device_bindings() {
    let dev = DeviceHandle::bind(BackendKind::Software, None, None).unwrap();
    let mut config = DecoderConfig::new(Codec::H264);
    config.device = Some(dev.clone());
    let mut dec = Decoder::new(config).unwrap();

    let nv12 = gradient_nv12(32, 32);
    let pkt = raw_packet(Codec::H264, 32, 32, 5, &nv12);

    let other = DeviceHandle::bind(BackendKind::Software, None, None).unwrap();
    let mut delivered = false;
    dec.decode(&pkt, |frame| {
        assert_eq!((frame.width(), frame.height()), (32, 32));
        assert_eq!(frame.pts(), 5);
        let fd = frame.export_shared_handle().unwrap();
        let shared = other
            .open_shared_handle(fd.as_fd(), frame.texture().len())
            .unwrap();
        assert_eq!(shared, frame.texture());
        delivered = true;
    })
    .unwrap();
    assert!(delivered);
}

/// Encoder and decoder sessions can adopt one caller-owned device.
#[test]
fn sessions_share_an_adopted_device() {
    let dev = DeviceHandle::bind(BackendKind::Software, None, None).unwrap();
    assert!(dev.multithread_protected());

    let mut enc_config = EncoderConfig::new(Codec::H264, 64, 64);
    enc_config.device = Some(dev.clone());
    let enc = Encoder::new(enc_config).unwrap();

    let mut dec_config = DecoderConfig::new(Codec::H264);
    dec_config.device = Some(dev.clone());
    let dec = Decoder::new(dec_config).unwrap();

    assert_eq!(enc.device().adapter().id, dev.adapter().id);
    assert_eq!(dec.device().adapter().id, dev.adapter().id);
}

/// Model packets from the software encoder carry no pixels; feeding them
/// to a decoder is accepted as input without producing a frame.
#[test]
fn encoder_output_feeds_decoder_without_frames() {
    let mut enc = Encoder::new(EncoderConfig::new(Codec::H264, 64, 64)).unwrap();
    let mut packets = Vec::new();
    enc.encode(&gradient_nv12(64, 64), 0, |p| packets.push(p.data.clone()))
        .unwrap();

    let mut dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();
    let n = dec.decode(&packets[0], |_| panic!("no frame expected")).unwrap();
    assert_eq!(n, 0);
    assert_eq!(dec.state(), SessionState::Running);
}

/// A mid-stream resolution change is followed without reconstruction.
#[test]
fn decoder_follows_resolution_change() {
    let mut dec = Decoder::new(DecoderConfig::new(Codec::H264)).unwrap();

    let small = gradient_nv12(32, 32);
    dec.decode(&raw_packet(Codec::H264, 32, 32, 0, &small), |f| {
        assert_eq!((f.width(), f.height()), (32, 32));
    })
    .unwrap();

    let big = gradient_nv12(64, 48);
    dec.decode(&raw_packet(Codec::H264, 64, 48, 1, &big), |f| {
        assert_eq!((f.width(), f.height()), (64, 48));
        assert_eq!(f.texture().len(), 64 * 48 * 4);
    })
    .unwrap();
}

/// NV12 output skips conversion and hands back the coded frame verbatim.
#[test]
fn nv12_output_is_bit_exact() {
    let mut config = DecoderConfig::new(Codec::Hevc);
    config.output_format = PixelFormat::Nv12;
    let mut dec = Decoder::new(config).unwrap();
    let nv12 = gradient_nv12(48, 48);
    dec.decode(&raw_packet(Codec::Hevc, 48, 48, 0, &nv12), |f| {
        assert_eq!(f.format(), PixelFormat::Nv12);
        assert_eq!(f.texture(), &nv12[..]);
    })
    .unwrap();
}

/// Probing finds the software adapter for codecs it can run and nothing
/// for codecs it rejects.
#[test]
fn probe_roundtrip() {
    assert!(probe::driver_support(BackendKind::Software));

    let encoders = probe::test_encode(BackendKind::Software, None, Codec::H264);
    assert_eq!(encoders.len(), 1);
    assert!(probe::test_encode(BackendKind::Software, None, Codec::Av1).is_empty());

    let sample = probe::sample_bitstream(Codec::H264);
    let decoders = probe::test_decode(BackendKind::Software, None, Codec::H264, &sample);
    assert_eq!(decoders, encoders);
}

/// Fault injection is construction-time configuration, not ambient
/// state: a clean session on the same backend is unaffected.
#[test]
fn fault_injection_is_per_session() {
    let mut stuck_config = EncoderConfig::new(Codec::H264, 64, 64);
    stuck_config.fault = FaultInjection {
        always_busy: true,
        busy_per_frame: 0,
    };
    let mut stuck = Encoder::new(stuck_config).unwrap();
    let mut clean = Encoder::new(EncoderConfig::new(Codec::H264, 64, 64)).unwrap();

    let frame = gradient_nv12(64, 64);
    assert!(stuck.encode(&frame, 0, |_| {}).is_err());
    assert_eq!(clean.encode(&frame, 0, |_| {}).unwrap(), 1);
}
