//! H.264 bitstream support for the Vulkan backend.
//!
//! Splits Annex B streams into NAL units, tracks SPS/PPS via
//! `h264-reader`, and builds the `vk::native` std parameter structs the
//! video session parameter objects require.

use crate::error::{Error, Result};

use ash::vk::native as std_h264;
use h264_reader::nal::pps::PicParameterSet;
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::rbsp::BitReader;
use h264_reader::Context;

/// NAL unit type values we dispatch on.
pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Slot value meaning "no reference" in std reference lists.
const NO_REFERENCE: u8 = 0xFF;

/// Parsed SPS, reduced to the fields the decode session consumes.
#[derive(Debug, Clone)]
pub struct ParsedSps {
    pub sps_id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
    pub max_num_ref_frames: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub frame_mbs_only_flag: bool,
}

/// Parsed PPS, reduced to the fields the decode session consumes.
#[derive(Debug, Clone)]
pub struct ParsedPps {
    pub pps_id: u8,
    pub sps_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub pic_init_qp_minus26: i8,
    pub transform_8x8_mode_flag: bool,
}

/// SPS/PPS tracker fed from the incoming stream.
#[derive(Default)]
pub struct ParameterSets {
    sps: Option<ParsedSps>,
    pps: Option<ParsedPps>,
    context: Context,
}

impl std::fmt::Debug for ParameterSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSets")
            .field("sps", &self.sps)
            .field("pps", &self.pps)
            .finish()
    }
}

impl ParameterSets {
    /// Absorb one NAL unit; SPS and PPS update the tracker, everything
    /// else passes through.
    pub fn absorb(&mut self, nal: &[u8]) -> Result<()> {
        match nal_type(nal) {
            NAL_SPS => self.parse_sps(nal),
            NAL_PPS => self.parse_pps(nal),
            _ => Ok(()),
        }
    }

    fn parse_sps(&mut self, nal: &[u8]) -> Result<()> {
        let reader = BitReader::new(&nal[1..]);
        let sps = SeqParameterSet::from_bits(reader)
            .map_err(|e| Error::InvalidData(format!("SPS parse: {e:?}")))?;

        let (poc_type, log2_max_poc_lsb) = match &sps.pic_order_cnt {
            h264_reader::nal::sps::PicOrderCntType::TypeZero {
                log2_max_pic_order_cnt_lsb_minus4,
            } => (0u8, *log2_max_pic_order_cnt_lsb_minus4),
            h264_reader::nal::sps::PicOrderCntType::TypeOne { .. } => (1, 0),
            h264_reader::nal::sps::PicOrderCntType::TypeTwo => (2, 0),
        };
        let frame_mbs_only_flag = matches!(
            sps.frame_mbs_flags,
            h264_reader::nal::sps::FrameMbsFlags::Frames
        );
        let width = (sps.pic_width_in_mbs_minus1 + 1) * 16;
        let height =
            (sps.pic_height_in_map_units_minus1 + 1) * 16 * if frame_mbs_only_flag { 1 } else { 2 };

        self.sps = Some(ParsedSps {
            sps_id: sps.seq_parameter_set_id.id(),
            profile_idc: sps.profile_idc.into(),
            level_idc: sps.level_idc,
            width,
            height,
            max_num_ref_frames: sps.max_num_ref_frames as u8,
            log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
            pic_order_cnt_type: poc_type,
            log2_max_pic_order_cnt_lsb_minus4: log2_max_poc_lsb,
            frame_mbs_only_flag,
        });
        self.context.put_seq_param_set(sps);
        Ok(())
    }

    fn parse_pps(&mut self, nal: &[u8]) -> Result<()> {
        let reader = BitReader::new(&nal[1..]);
        let pps = PicParameterSet::from_bits(&self.context, reader)
            .map_err(|e| Error::InvalidData(format!("PPS parse: {e:?}")))?;

        self.pps = Some(ParsedPps {
            pps_id: pps.pic_parameter_set_id.id(),
            sps_id: pps.seq_parameter_set_id.id(),
            entropy_coding_mode_flag: pps.entropy_coding_mode_flag,
            pic_init_qp_minus26: pps.pic_init_qp_minus26 as i8,
            transform_8x8_mode_flag: pps
                .extension
                .as_ref()
                .map(|e| e.transform_8x8_mode_flag)
                .unwrap_or(false),
        });
        self.context.put_pic_param_set(pps);
        Ok(())
    }

    /// Active SPS, if one has been seen.
    pub fn sps(&self) -> Option<&ParsedSps> {
        self.sps.as_ref()
    }

    /// Active PPS, if one has been seen.
    pub fn pps(&self) -> Option<&ParsedPps> {
        self.pps.as_ref()
    }

    /// Whether a session can be created (one SPS and one PPS seen).
    pub fn complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}

/// Split an Annex B byte stream at 3- and 4-byte start codes.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let start = if data[i..].starts_with(&[0, 0, 0, 1]) {
            i + 4
        } else if data[i..].starts_with(&[0, 0, 1]) {
            i + 3
        } else {
            i += 1;
            continue;
        };
        let mut end = start;
        while end < data.len() {
            if data[end..].starts_with(&[0, 0, 1]) || data[end..].starts_with(&[0, 0, 0, 1]) {
                break;
            }
            end += 1;
        }
        if start < end {
            nals.push(&data[start..end]);
        }
        i = end;
    }
    nals
}

/// NAL unit type of a unit without its start code.
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Whether the unit is a coded slice (IDR or non-IDR).
pub fn is_slice(nal: &[u8]) -> bool {
    matches!(nal_type(nal), NAL_SLICE | NAL_IDR)
}

fn level_to_std(level_idc: u8) -> std_h264::StdVideoH264LevelIdc {
    match level_idc {
        0..=10 => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_0,
        11..=20 => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_0,
        21..=30 => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_0,
        31..=40 => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_0,
        41..=42 => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_2,
        43..=50 => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_0,
        _ => std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_1,
    }
}

/// Build the std SPS struct from a parsed SPS.
///
/// The bindgen struct carries raw pointers for optional tables; zeroed
/// means "absent" for all of them.
pub fn std_sps(sps: &ParsedSps) -> std_h264::StdVideoH264SequenceParameterSet {
    let mut out: std_h264::StdVideoH264SequenceParameterSet = unsafe { std::mem::zeroed() };
    out.flags.set_frame_mbs_only_flag(sps.frame_mbs_only_flag as u32);
    out.flags.set_direct_8x8_inference_flag(1);
    out.profile_idc = sps.profile_idc as std_h264::StdVideoH264ProfileIdc;
    out.level_idc = level_to_std(sps.level_idc);
    out.chroma_format_idc =
        std_h264::StdVideoH264ChromaFormatIdc_STD_VIDEO_H264_CHROMA_FORMAT_IDC_420;
    out.seq_parameter_set_id = sps.sps_id;
    out.log2_max_frame_num_minus4 = sps.log2_max_frame_num_minus4;
    out.pic_order_cnt_type = sps.pic_order_cnt_type as std_h264::StdVideoH264PocType;
    out.log2_max_pic_order_cnt_lsb_minus4 = sps.log2_max_pic_order_cnt_lsb_minus4;
    out.max_num_ref_frames = sps.max_num_ref_frames;
    out.pic_width_in_mbs_minus1 = sps.width / 16 - 1;
    out.pic_height_in_map_units_minus1 =
        sps.height / 16 / if sps.frame_mbs_only_flag { 1 } else { 2 } - 1;
    out
}

/// Build the std PPS struct from a parsed PPS.
pub fn std_pps(pps: &ParsedPps) -> std_h264::StdVideoH264PictureParameterSet {
    let mut out: std_h264::StdVideoH264PictureParameterSet = unsafe { std::mem::zeroed() };
    out.flags
        .set_entropy_coding_mode_flag(pps.entropy_coding_mode_flag as u32);
    out.flags
        .set_transform_8x8_mode_flag(pps.transform_8x8_mode_flag as u32);
    out.flags.set_deblocking_filter_control_present_flag(1);
    out.pic_parameter_set_id = pps.pps_id;
    out.seq_parameter_set_id = pps.sps_id;
    out.pic_init_qp_minus26 = pps.pic_init_qp_minus26;
    out
}

/// Synthesize an encode-side SPS for `width` x `height` 4:2:0 8-bit.
pub fn encode_sps(width: u32, height: u32) -> std_h264::StdVideoH264SequenceParameterSet {
    let mbs_w = width.div_ceil(16);
    let mbs_h = height.div_ceil(16);

    let mut out: std_h264::StdVideoH264SequenceParameterSet = unsafe { std::mem::zeroed() };
    out.flags.set_frame_mbs_only_flag(1);
    out.flags.set_direct_8x8_inference_flag(1);
    if mbs_w * 16 != width || mbs_h * 16 != height {
        out.flags.set_frame_cropping_flag(1);
        out.frame_crop_right_offset = (mbs_w * 16 - width) / 2;
        out.frame_crop_bottom_offset = (mbs_h * 16 - height) / 2;
    }
    out.profile_idc = std_h264::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH;
    out.level_idc = std_h264::StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_1;
    out.chroma_format_idc =
        std_h264::StdVideoH264ChromaFormatIdc_STD_VIDEO_H264_CHROMA_FORMAT_IDC_420;
    out.pic_order_cnt_type = std_h264::StdVideoH264PocType_STD_VIDEO_H264_POC_TYPE_2;
    out.max_num_ref_frames = 1;
    out.pic_width_in_mbs_minus1 = mbs_w - 1;
    out.pic_height_in_map_units_minus1 = mbs_h - 1;
    out
}

/// Synthesize the matching encode-side PPS.
pub fn encode_pps() -> std_h264::StdVideoH264PictureParameterSet {
    let mut out: std_h264::StdVideoH264PictureParameterSet = unsafe { std::mem::zeroed() };
    out.flags.set_entropy_coding_mode_flag(1);
    out.flags.set_deblocking_filter_control_present_flag(1);
    out
}

/// Reference lists with no active entries, for IDR pictures.
pub fn empty_reference_lists() -> std_h264::StdVideoEncodeH264ReferenceListsInfo {
    let mut out: std_h264::StdVideoEncodeH264ReferenceListsInfo = unsafe { std::mem::zeroed() };
    out.RefPicList0 = [NO_REFERENCE; 32];
    out.RefPicList1 = [NO_REFERENCE; 32];
    out
}

/// Reference lists pointing at a single previous DPB slot.
pub fn single_reference_lists(slot: u8) -> std_h264::StdVideoEncodeH264ReferenceListsInfo {
    let mut out = empty_reference_lists();
    out.RefPicList0[0] = slot;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annexb_split_handles_both_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1e, // SPS
            0x00, 0x00, 0x01, 0x68, 0xce, 0x38, 0x80, // PPS
        ];
        let nals = split_annexb(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nal_type(nals[0]), NAL_SPS);
        assert_eq!(nal_type(nals[1]), NAL_PPS);
    }

    #[test]
    fn slice_classification() {
        assert!(is_slice(&[0x65]));
        assert!(is_slice(&[0x41]));
        assert!(!is_slice(&[0x67]));
        assert!(!is_slice(&[]));
    }

    #[test]
    fn encode_sps_crops_odd_macroblock_sizes() {
        let sps = encode_sps(1920, 1080);
        assert_eq!(sps.pic_width_in_mbs_minus1, 119);
        assert_eq!(sps.pic_height_in_map_units_minus1, 67);
        assert_eq!(sps.frame_crop_bottom_offset, (1088 - 1080) / 2);
    }
}
