//! Stream probing — codec detection and H.264 SPS parsing.
//!
//! Raw elementary streams carry no container header, so the codec comes
//! from the file extension and the geometry from the first sequence
//! parameter set. HEVC and the other codecs need explicit dimensions
//! there; containers carry the HEVC SPS in hvcC, read by
//! [`parse_h265_sps`].

use std::path::Path;

use tracing::debug;
use vs_common::{
    ChromaFormat, DemuxError, FieldOrder, Rational, Resolution, StreamInfo, VideoCodec,
};

use crate::bitreader::BitReader;
use crate::nal::{
    annexb_nal_units, hevc_nal_unit_type, nal_unit_type, remove_emulation_prevention,
    H264NalType, HEVC_NAL_SPS,
};

/// Caller-supplied stream properties that override (or replace) probing.
#[derive(Clone, Debug, Default)]
pub struct StreamOverrides {
    pub codec: Option<VideoCodec>,
    /// Coded width in pixels.
    pub width: Option<u32>,
    /// Coded height in pixels.
    pub height: Option<u32>,
    pub field_order: Option<FieldOrder>,
    pub frame_rate: Option<Rational>,
    /// Luma bit depth, for streams whose headers are not probed.
    pub bit_depth: Option<u8>,
}

/// Detect the codec of a raw elementary stream from its file extension.
pub fn detect_codec(path: &Path) -> Result<VideoCodec, DemuxError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    VideoCodec::from_extension(ext)
        .ok_or_else(|| DemuxError::UnsupportedContainer(path.display().to_string()))
}

/// Fields of an H.264 sequence parameter set that describe the picture
/// geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    /// Luma bit depth.
    pub bit_depth: u8,
    pub frame_mbs_only: bool,
    /// Macroblock-aligned size.
    pub coded: Resolution,
    /// Size after the frame cropping window.
    pub display: Resolution,
    pub max_num_ref_frames: u32,
}

/// High profiles carry chroma format and bit depth in the SPS.
fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Largest picture dimension accepted, in macroblocks (16384 pixels).
const MAX_SIZE_MBS: u32 = 1024;

/// bit_depth_luma_minus8, bounded by the codec's deepest profile.
fn read_bit_depth(r: &mut BitReader<'_>, max_minus8: u32) -> Result<u8, DemuxError> {
    let minus8 = r.read_ue()?;
    if minus8 > max_minus8 {
        return Err(invalid_sps(r, "bit depth out of range"));
    }
    Ok(8 + minus8 as u8)
}

fn invalid_sps(r: &BitReader<'_>, reason: &str) -> DemuxError {
    DemuxError::InvalidStructure {
        offset: r.byte_pos() as u64,
        reason: format!("SPS: {reason}"),
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), DemuxError> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale as i64 + delta as i64).rem_euclid(256) as i32;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Parse an SPS NAL unit (header byte included, emulation prevention
/// still present).
pub fn parse_h264_sps(nal: &[u8]) -> Result<SpsInfo, DemuxError> {
    if nal.is_empty() || nal_unit_type(nal[0]) != H264NalType::Sps {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: "not an SPS NAL unit".into(),
        });
    }
    let rbsp = remove_emulation_prevention(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)? as u8;
    r.skip(8)?; // constraint flags + reserved
    let level_idc = r.read_bits(8)? as u8;
    let _sps_id = r.read_ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth = 8;
    if has_chroma_info(profile_idc) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc > 3 {
            return Err(invalid_sps(&r, "chroma_format_idc out of range"));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()?;
        }
        bit_depth = read_bit_depth(&mut r, 6)?;
        let _bit_depth_chroma = r.read_ue()?;
        r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.read_ue()?;
    match r.read_ue()? {
        0 => {
            let _log2_max_poc_lsb = r.read_ue()?;
        }
        1 => {
            r.skip(1)?; // delta_pic_order_always_zero_flag
            let _offset_for_non_ref_pic = r.read_se()?;
            let _offset_for_top_to_bottom_field = r.read_se()?;
            let cycle = r.read_ue()?;
            if cycle > 255 {
                return Err(invalid_sps(&r, "num_ref_frames_in_pic_order_cnt_cycle out of range"));
            }
            for _ in 0..cycle {
                let _offset_for_ref_frame = r.read_se()?;
            }
        }
        _ => {}
    }

    let max_num_ref_frames = r.read_ue()?;
    r.skip(1)?; // gaps_in_frame_num_value_allowed_flag
    let width_mbs = r.read_ue()? + 1;
    let height_map_units = r.read_ue()? + 1;
    if width_mbs > MAX_SIZE_MBS || height_map_units > MAX_SIZE_MBS {
        return Err(invalid_sps(&r, "picture size out of range"));
    }
    let frame_mbs_only = r.read_bit()?;
    if !frame_mbs_only {
        r.skip(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip(1)?; // direct_8x8_inference_flag

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let coded = Resolution::new(width_mbs * 16, height_map_units * 16 * field_factor);

    let mut display = coded;
    if r.read_bit()? {
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;

        let chroma_array_type = if separate_colour_plane {
            0
        } else {
            chroma_format_idc
        };
        let (crop_x, crop_y) = match chroma_array_type {
            0 => (1, field_factor),
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        };
        let crop = |unit: u32, a: u32, b: u32| (a as u64 + b as u64) * unit as u64;
        let crop_w = crop(crop_x, left, right);
        let crop_h = crop(crop_y, top, bottom);
        if crop_w >= coded.width as u64 || crop_h >= coded.height as u64 {
            return Err(invalid_sps(&r, "frame cropping exceeds picture size"));
        }
        display = Resolution::new(
            coded.width - crop_w as u32,
            coded.height - crop_h as u32,
        );
    }

    Ok(SpsInfo {
        profile_idc,
        level_idc,
        chroma_format_idc,
        bit_depth,
        frame_mbs_only,
        coded,
        display,
        max_num_ref_frames,
    })
}

/// Find and parse the first SPS in an Annex-B byte stream.
pub fn find_h264_sps(data: &[u8]) -> Result<SpsInfo, DemuxError> {
    annexb_nal_units(data)
        .into_iter()
        .find(|nal| nal_unit_type(nal[0]) == H264NalType::Sps)
        .ok_or_else(|| DemuxError::InvalidStructure {
            offset: 0,
            reason: "no SPS found in stream head".into(),
        })
        .and_then(parse_h264_sps)
}

/// Parse an HEVC SPS NAL unit (two-byte header included, emulation
/// prevention still present). HEVC codes whole frames, so
/// `frame_mbs_only` is always set; `max_num_ref_frames` carries
/// `sps_max_dec_pic_buffering_minus1` of the highest sub-layer.
pub fn parse_h265_sps(nal: &[u8]) -> Result<SpsInfo, DemuxError> {
    if nal.len() < 2 || hevc_nal_unit_type(nal[0]) != HEVC_NAL_SPS {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: "not an HEVC SPS NAL unit".into(),
        });
    }
    let rbsp = remove_emulation_prevention(&nal[2..]);
    let mut r = BitReader::new(&rbsp);

    r.skip(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)? as usize;
    r.skip(1)?; // sps_temporal_id_nesting_flag

    // profile_tier_level: general profile space, tier and idc, then
    // compatibility and constraint flags (88 bits in total) and the level.
    r.skip(3)?;
    let profile_idc = r.read_bits(5)? as u8;
    r.skip(80)?;
    let level_idc = r.read_bits(8)? as u8;
    let mut sub_layer_flags = [(false, false); 7];
    for flags in sub_layer_flags.iter_mut().take(max_sub_layers_minus1) {
        *flags = (r.read_bit()?, r.read_bit()?);
    }
    if max_sub_layers_minus1 > 0 {
        r.skip(2 * (8 - max_sub_layers_minus1))?; // reserved_zero_2bits
    }
    for &(profile_present, level_present) in sub_layer_flags.iter().take(max_sub_layers_minus1) {
        if profile_present {
            r.skip(88)?;
        }
        if level_present {
            r.skip(8)?;
        }
    }

    let _sps_id = r.read_ue()?;
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc > 3 {
        return Err(invalid_sps(&r, "chroma_format_idc out of range"));
    }
    if chroma_format_idc == 3 {
        r.skip(1)?; // separate_colour_plane_flag
    }
    let width = r.read_ue()?;
    let height = r.read_ue()?;
    let max_size = MAX_SIZE_MBS * 16;
    if width == 0 || height == 0 || width > max_size || height > max_size {
        return Err(invalid_sps(&r, "picture size out of range"));
    }
    let coded = Resolution::new(width, height);

    let mut display = coded;
    if r.read_bit()? {
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;
        let (sub_w, sub_h) = match chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let crop_w = (left as u64 + right as u64) * sub_w;
        let crop_h = (top as u64 + bottom as u64) * sub_h;
        if crop_w >= width as u64 || crop_h >= height as u64 {
            return Err(invalid_sps(&r, "conformance window exceeds picture size"));
        }
        display = Resolution::new(width - crop_w as u32, height - crop_h as u32);
    }

    let bit_depth = read_bit_depth(&mut r, 8)?;
    let _bit_depth_chroma = r.read_ue()?;
    let _log2_max_poc_lsb = r.read_ue()?;
    let ordering_info_present = r.read_bit()?;
    let first = if ordering_info_present { 0 } else { max_sub_layers_minus1 };
    let mut max_dec_pic_buffering = 0;
    for _ in first..=max_sub_layers_minus1 {
        max_dec_pic_buffering = r.read_ue()?;
        let _num_reorder_pics = r.read_ue()?;
        let _max_latency_increase = r.read_ue()?;
    }

    Ok(SpsInfo {
        profile_idc,
        level_idc,
        chroma_format_idc,
        bit_depth,
        frame_mbs_only: true,
        coded,
        display,
        max_num_ref_frames: max_dec_pic_buffering,
    })
}

/// Build stream info for a raw elementary stream from its first bytes.
pub fn probe_elementary(
    codec: VideoCodec,
    head: &[u8],
    overrides: &StreamOverrides,
) -> Result<StreamInfo, DemuxError> {
    let mut info = StreamInfo {
        codec,
        coded: Resolution::new(0, 0),
        display: Resolution::new(0, 0),
        chroma_format: ChromaFormat::Yuv420,
        bit_depth: 8,
        field_order: FieldOrder::Unknown,
        // Raw streams have no timestamps.
        time_base: Rational { num: 0, den: 1 },
        frame_rate: overrides.frame_rate,
        video_stream_index: 0,
        extra_data: Vec::new(),
    };

    if codec == VideoCodec::H264 {
        let sps = find_h264_sps(head)?;
        debug!(
            profile = sps.profile_idc,
            level = sps.level_idc,
            coded = %sps.coded,
            display = %sps.display,
            frame_mbs_only = sps.frame_mbs_only,
            "Parsed H.264 SPS"
        );
        info.coded = sps.coded;
        info.display = sps.display;
        info.chroma_format = ChromaFormat::from_idc(sps.chroma_format_idc).unwrap_or_default();
        info.bit_depth = sps.bit_depth;
        info.field_order = if sps.frame_mbs_only {
            FieldOrder::Progressive
        } else {
            FieldOrder::Unknown
        };
    }

    if let (Some(w), Some(h)) = (overrides.width, overrides.height) {
        info.coded = Resolution::new(w, h);
        if info.display.width == 0 || info.display.width > w || info.display.height > h {
            info.display = info.coded;
        }
    }
    if let Some(order) = overrides.field_order {
        info.field_order = order;
    }
    if let Some(depth) = overrides.bit_depth {
        info.bit_depth = depth;
    }

    if info.coded.width == 0 || info.coded.height == 0 {
        return Err(DemuxError::MissingDimensions(codec));
    }
    Ok(info)
}
