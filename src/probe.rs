//! Capability probing: driver availability and per-adapter trial sessions.
//!
//! A probe answers "which adapters can actually run this configuration"
//! by attempting a minimal one-frame session on every candidate adapter,
//! one thread per adapter, and collecting the identities that succeed.
//! Probes are session-independent and safe to run before any session
//! exists.

use crate::backend::{soft, BackendKind};
use crate::decode::{Decoder, DecoderConfig};
use crate::device::{AdapterId, AdapterVendor, DeviceHandle};
use crate::encode::{Encoder, EncoderConfig};
use crate::format::{Codec, PixelFormat};

/// Whether the backend's driver stack can be loaded at all.
///
/// Cheaper than a trial session; a `false` here means probing individual
/// adapters is pointless.
pub fn driver_support(kind: BackendKind) -> bool {
    match kind {
        BackendKind::Software => true,
        #[cfg(feature = "vulkan-video")]
        BackendKind::Vulkan => crate::backend::vulkan::driver_available(),
    }
}

/// Probe geometry: small enough to be fast, large enough to be honest.
const PROBE_WIDTH: u32 = 256;
const PROBE_HEIGHT: u32 = 256;

/// Try a one-frame encode on every adapter of `kind` (optionally filtered
/// by vendor) and return the adapters that produced a packet.
pub fn test_encode(
    kind: BackendKind,
    vendor: Option<AdapterVendor>,
    codec: Codec,
) -> Vec<AdapterId> {
    let adapters = match DeviceHandle::enumerate_adapters(kind, vendor) {
        Ok(a) => a,
        Err(_) => return Vec::new(),
    };

    let handles: Vec<_> = adapters
        .into_iter()
        .map(|adapter| {
            std::thread::spawn(move || {
                let id = adapter.id;
                try_encode_on(kind, id, codec).then_some(id)
            })
        })
        .collect();

    collect_joined(handles)
}

/// Try a one-frame decode of `sample` on every adapter of `kind` and
/// return the adapters that produced a frame.
///
/// For the software backend, [`sample_bitstream`] builds a suitable
/// sample; hardware callers typically carry a tiny canned keyframe.
pub fn test_decode(
    kind: BackendKind,
    vendor: Option<AdapterVendor>,
    codec: Codec,
    sample: &[u8],
) -> Vec<AdapterId> {
    let adapters = match DeviceHandle::enumerate_adapters(kind, vendor) {
        Ok(a) => a,
        Err(_) => return Vec::new(),
    };

    let handles: Vec<_> = adapters
        .into_iter()
        .map(|adapter| {
            let sample = sample.to_vec();
            std::thread::spawn(move || {
                let id = adapter.id;
                try_decode_on(kind, id, codec, &sample).then_some(id)
            })
        })
        .collect();

    collect_joined(handles)
}

/// Best working adapter per codec, encode direction.
///
/// Runs [`test_encode`] for each codec and keeps the first adapter that
/// passed. `None` for codecs no adapter can encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestEncoders {
    /// First working adapter for H.264, if any.
    pub h264: Option<AdapterId>,
    /// First working adapter for H.265, if any.
    pub hevc: Option<AdapterId>,
}

/// Probe all codecs and pick the first working adapter for each.
pub fn best_encoders(kind: BackendKind) -> BestEncoders {
    BestEncoders {
        h264: test_encode(kind, None, Codec::H264).into_iter().next(),
        hevc: test_encode(kind, None, Codec::Hevc).into_iter().next(),
    }
}

/// Build a decodable one-frame sample stream (blank mid-gray frame).
pub fn sample_bitstream(codec: Codec) -> Vec<u8> {
    let nv12 = blank_nv12(PROBE_WIDTH, PROBE_HEIGHT);
    // Framing never fails for a well-sized buffer.
    soft::raw_frame_packet(codec, PROBE_WIDTH, PROBE_HEIGHT, 0, true, &nv12)
        .unwrap_or_default()
}

fn blank_nv12(width: u32, height: u32) -> Vec<u8> {
    let mut buf = vec![128u8; PixelFormat::Nv12.buffer_size(width, height)];
    buf[..(width * height) as usize].fill(16);
    buf
}

fn try_encode_on(kind: BackendKind, adapter: AdapterId, codec: Codec) -> bool {
    let mut config = EncoderConfig::new(codec, PROBE_WIDTH, PROBE_HEIGHT);
    config.backend = kind;
    config.adapter = Some(adapter);
    let Ok(mut encoder) = Encoder::new(config) else {
        return false;
    };
    let frame = blank_nv12(PROBE_WIDTH, PROBE_HEIGHT);
    let mut produced = false;
    let ok = encoder
        .encode(&frame, 0, |packet| produced = !packet.data.is_empty())
        .is_ok();
    ok && produced
}

fn try_decode_on(kind: BackendKind, adapter: AdapterId, codec: Codec, sample: &[u8]) -> bool {
    let mut config = DecoderConfig::new(codec);
    config.backend = kind;
    config.adapter = Some(adapter);
    let Ok(mut decoder) = Decoder::new(config) else {
        return false;
    };
    let mut produced = false;
    let ok = decoder
        .decode(sample, |frame| produced = !frame.texture().is_empty())
        .is_ok();
    ok && produced
}

fn collect_joined(handles: Vec<std::thread::JoinHandle<Option<AdapterId>>>) -> Vec<AdapterId> {
    let mut ids: Vec<AdapterId> = handles
        .into_iter()
        .filter_map(|h| h.join().ok().flatten())
        .collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SOFT_ADAPTER;

    #[test]
    fn software_driver_always_supported() {
        assert!(driver_support(BackendKind::Software));
    }

    #[test]
    fn encode_probe_finds_software_adapter() {
        let ids = test_encode(BackendKind::Software, None, Codec::H264);
        assert_eq!(ids, vec![SOFT_ADAPTER]);
    }

    #[test]
    fn encode_probe_av1_finds_nothing() {
        // The software encoder rejects AV1 at construction.
        assert!(test_encode(BackendKind::Software, None, Codec::Av1).is_empty());
    }

    #[test]
    fn decode_probe_roundtrips_sample() {
        let sample = sample_bitstream(Codec::Hevc);
        let ids = test_decode(BackendKind::Software, None, Codec::Hevc, &sample);
        assert_eq!(ids, vec![SOFT_ADAPTER]);
    }

    #[test]
    fn decode_probe_wrong_codec_sample_fails() {
        let sample = sample_bitstream(Codec::H264);
        assert!(test_decode(BackendKind::Software, None, Codec::Hevc, &sample).is_empty());
    }

    #[test]
    fn vendor_filter_excludes_software() {
        let ids = test_encode(
            BackendKind::Software,
            Some(AdapterVendor::Nvidia),
            Codec::H264,
        );
        assert!(ids.is_empty());
    }

    #[test]
    fn best_encoders_picks_working_codecs() {
        let best = best_encoders(BackendKind::Software);
        assert_eq!(best.h264, Some(SOFT_ADAPTER));
        assert_eq!(best.hevc, Some(SOFT_ADAPTER));
    }
}
