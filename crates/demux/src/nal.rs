//! NAL unit handling — Annex-B scanning, AVCC to Annex-B conversion and
//! the avcC configuration record.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::debug;
use vs_common::{BitstreamFilter, DemuxError, Packet, StreamInfo, VideoCodec};

/// NAL unit type for H.264.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    SliceA,
    SliceB,
    SliceC,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    EndSeq,
    EndStream,
    FillerData,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            2 => Self::SliceA,
            3 => Self::SliceB,
            4 => Self::SliceC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndSeq,
            11 => Self::EndStream,
            12 => Self::FillerData,
            other => Self::Other(other),
        }
    }
}

/// Annex-B start code (4 bytes).
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Split an Annex-B byte stream into NAL unit payloads (start codes
/// removed). Accepts both 3- and 4-byte start codes.
pub fn annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(&next) => next - 3,
            None => data.len(),
        };
        // Trailing zero belongs to the next 4-byte start code.
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            units.push(&data[start..end]);
        }
    }
    units
}

/// Strip emulation-prevention bytes (`00 00 03` → `00 00`) from a NAL
/// payload to get the raw RBSP.
pub fn remove_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &byte in nal {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// Convert AVCC-formatted NAL units to Annex-B format.
///
/// AVCC: `[length_size bytes length][NAL data]...`
/// Annex-B: `[0x00 0x00 0x00 0x01][NAL data]...`
pub fn avcc_to_annexb(avcc_data: &[u8], length_size: u8) -> Result<Vec<u8>, DemuxError> {
    let mut output = Vec::with_capacity(avcc_data.len() + 64);
    let ls = length_size as usize;
    let mut offset = 0;

    while offset < avcc_data.len() {
        if offset + ls > avcc_data.len() {
            return Err(DemuxError::TruncatedData {
                expected: offset + ls,
                got: avcc_data.len(),
            });
        }
        let nal_len = read_nal_length(&avcc_data[offset..], ls);
        offset += ls;

        if offset + nal_len > avcc_data.len() {
            return Err(DemuxError::TruncatedData {
                expected: offset + nal_len,
                got: avcc_data.len(),
            });
        }

        output.extend_from_slice(&ANNEXB_START_CODE);
        output.extend_from_slice(&avcc_data[offset..offset + nal_len]);
        offset += nal_len;
    }

    Ok(output)
}

/// Read a variable-length NAL unit size (1, 2, 3, or 4 bytes big-endian).
fn read_nal_length(data: &[u8], length_size: usize) -> usize {
    let mut val: usize = 0;
    for &byte in &data[..length_size] {
        val = (val << 8) | byte as usize;
    }
    val
}

/// Extract the NAL unit type from the first byte of NAL data.
pub fn nal_unit_type(nal_first_byte: u8) -> H264NalType {
    H264NalType::from(nal_first_byte)
}

/// HEVC NAL unit types carried in hvcC parameter-set arrays.
pub const HEVC_NAL_VPS: u8 = 32;
pub const HEVC_NAL_SPS: u8 = 33;
pub const HEVC_NAL_PPS: u8 = 34;

/// HEVC NAL unit type from the first byte of the two-byte NAL header.
pub fn hevc_nal_unit_type(nal_first_byte: u8) -> u8 {
    (nal_first_byte >> 1) & 0x3F
}

// ─── avcC record ────────────────────────────────────────────────────

/// AVC Decoder Configuration Record (the avcC box payload).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvccConfig {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    /// NAL unit length size minus one (typically 3, meaning 4-byte lengths)
    pub length_size_minus_one: u8,
    pub sps_list: Vec<Vec<u8>>,
    pub pps_list: Vec<Vec<u8>>,
}

impl AvccConfig {
    /// The byte size used for NAL unit length fields in the bitstream.
    pub fn length_size(&self) -> u8 {
        self.length_size_minus_one + 1
    }

    /// Parse an AVCDecoderConfigurationRecord.
    pub fn parse(data: &[u8]) -> Result<Self, DemuxError> {
        let mut reader = Cursor::new(data);
        let config_version = reader.read_u8()?;
        if config_version != 1 {
            return Err(DemuxError::InvalidStructure {
                offset: 0,
                reason: format!("Unexpected avcC version: {}", config_version),
            });
        }

        let profile = reader.read_u8()?;
        let profile_compat = reader.read_u8()?;
        let level = reader.read_u8()?;
        let length_size_minus_one = reader.read_u8()? & 0x03;

        let sps_count = (reader.read_u8()? & 0x1F) as usize;
        let sps_list = read_parameter_sets(&mut reader, sps_count)?;
        let pps_count = reader.read_u8()? as usize;
        let pps_list = read_parameter_sets(&mut reader, pps_count)?;

        debug!(
            "avcC: profile={}, level={}, length_size={}, {} SPS, {} PPS",
            profile,
            level,
            length_size_minus_one + 1,
            sps_list.len(),
            pps_list.len()
        );

        Ok(Self {
            profile,
            profile_compat,
            level,
            length_size_minus_one,
            sps_list,
            pps_list,
        })
    }
}

fn read_parameter_sets(
    reader: &mut Cursor<&[u8]>,
    count: usize,
) -> Result<Vec<Vec<u8>>, DemuxError> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u16::<BigEndian>()? as usize;
        let mut set = vec![0u8; len];
        reader.read_exact(&mut set)?;
        sets.push(set);
    }
    Ok(sets)
}

// ─── hvcC record ────────────────────────────────────────────────────

/// Fixed-size head of an HEVCDecoderConfigurationRecord, up to and
/// including `numOfArrays`.
const HVCC_HEADER_LEN: usize = 23;

/// HEVC Decoder Configuration Record (the hvcC box payload).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HvccConfig {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub length_size_minus_one: u8,
    /// Parameter-set NAL units (header included) in record order,
    /// normally VPS, SPS, PPS.
    pub parameter_sets: Vec<Vec<u8>>,
}

impl HvccConfig {
    pub fn length_size(&self) -> u8 {
        self.length_size_minus_one + 1
    }

    /// The first SPS NAL unit in the record.
    pub fn sps(&self) -> Option<&[u8]> {
        self.parameter_sets
            .iter()
            .find(|nal| !nal.is_empty() && hevc_nal_unit_type(nal[0]) == HEVC_NAL_SPS)
            .map(Vec::as_slice)
    }

    /// Parse an HEVCDecoderConfigurationRecord.
    pub fn parse(data: &[u8]) -> Result<Self, DemuxError> {
        if data.len() < HVCC_HEADER_LEN {
            return Err(DemuxError::TruncatedData {
                expected: HVCC_HEADER_LEN,
                got: data.len(),
            });
        }
        if data[0] != 1 {
            return Err(DemuxError::InvalidStructure {
                offset: 0,
                reason: format!("Unexpected hvcC version: {}", data[0]),
            });
        }
        let general_profile_idc = data[1] & 0x1F;
        let general_level_idc = data[12];
        let length_size_minus_one = data[21] & 0x03;
        let num_arrays = data[22] as usize;

        let mut reader = Cursor::new(&data[HVCC_HEADER_LEN..]);
        let mut parameter_sets = Vec::new();
        for _ in 0..num_arrays {
            let _nal_type = reader.read_u8()? & 0x3F;
            let count = reader.read_u16::<BigEndian>()? as usize;
            parameter_sets.extend(read_parameter_sets(&mut reader, count)?);
        }

        debug!(
            "hvcC: profile={}, level={}, length_size={}, {} parameter sets",
            general_profile_idc,
            general_level_idc,
            length_size_minus_one + 1,
            parameter_sets.len()
        );

        Ok(Self {
            general_profile_idc,
            general_level_idc,
            length_size_minus_one,
            parameter_sets,
        })
    }
}

// ─── Bitstream filter ───────────────────────────────────────────────

/// Rewrites length-prefixed (avcC/hvcC framed) packets into Annex-B and
/// prepends the parameter sets to keyframes that do not carry their own.
#[derive(Debug)]
pub struct AvccToAnnexB {
    codec: VideoCodec,
    length_size: u8,
    /// Start-code framed parameter sets, ready to prepend.
    parameter_sets: Vec<u8>,
}

impl AvccToAnnexB {
    pub fn new(config: AvccConfig) -> Self {
        let sets = config.sps_list.iter().chain(&config.pps_list);
        Self::framed(VideoCodec::H264, config.length_size(), sets)
    }

    pub fn from_hvcc(config: HvccConfig) -> Self {
        Self::framed(VideoCodec::H265, config.length_size(), &config.parameter_sets)
    }

    fn framed<'a>(
        codec: VideoCodec,
        length_size: u8,
        sets: impl IntoIterator<Item = &'a Vec<u8>>,
    ) -> Self {
        let mut parameter_sets = Vec::new();
        for set in sets {
            parameter_sets.extend_from_slice(&ANNEXB_START_CODE);
            parameter_sets.extend_from_slice(set);
        }
        Self {
            codec,
            length_size,
            parameter_sets,
        }
    }

    pub fn from_extradata(extra_data: &[u8]) -> Result<Self, DemuxError> {
        AvccConfig::parse(extra_data).map(Self::new)
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn length_size(&self) -> u8 {
        self.length_size
    }

    fn is_sps(&self, nal: &[u8]) -> bool {
        match self.codec {
            VideoCodec::H265 => hevc_nal_unit_type(nal[0]) == HEVC_NAL_SPS,
            _ => nal_unit_type(nal[0]) == H264NalType::Sps,
        }
    }
}

impl BitstreamFilter for AvccToAnnexB {
    fn filter(&mut self, mut packet: Packet) -> Result<Packet, DemuxError> {
        let annexb = avcc_to_annexb(&packet.data, self.length_size)?;
        let has_sps = annexb_nal_units(&annexb)
            .iter()
            .any(|nal| self.is_sps(nal));

        packet.data = if packet.is_keyframe && !has_sps {
            let mut out = Vec::with_capacity(self.parameter_sets.len() + annexb.len());
            out.extend_from_slice(&self.parameter_sets);
            out.extend_from_slice(&annexb);
            out
        } else {
            annexb
        };
        Ok(packet)
    }
}

/// The filter a stream needs before its packets can be fed to the engine:
/// length-prefixed H.264 or HEVC (avcC/hvcC extradata present) gets
/// [`AvccToAnnexB`].
pub fn filter_for_stream(info: &StreamInfo) -> Result<Option<Box<dyn BitstreamFilter>>, DemuxError> {
    if info.extra_data.first() != Some(&1) {
        return Ok(None);
    }
    let filter = match info.codec {
        VideoCodec::H264 => AvccToAnnexB::from_extradata(&info.extra_data)?,
        VideoCodec::H265 => AvccToAnnexB::from_hvcc(HvccConfig::parse(&info.extra_data)?),
        _ => return Ok(None),
    };
    Ok(Some(Box::new(filter)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn avcc_record() -> Vec<u8> {
        let sps = [0x67, 0x42, 0x00, 0x1E];
        let pps = [0x68, 0xCE];
        let mut rec = vec![1, 0x42, 0x00, 0x1E, 0xFF, 0xE1];
        rec.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        rec.extend_from_slice(&sps);
        rec.push(1);
        rec.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        rec.extend_from_slice(&pps);
        rec
    }

    pub(crate) fn hvcc_record() -> Vec<u8> {
        let mut rec = vec![0u8; 23];
        rec[0] = 1;
        rec[1] = 0x01; // Main
        rec[12] = 93; // level 3.1
        rec[21] = 0x0F; // 4-byte lengths
        rec[22] = 3;
        for nal in [&[0x40, 0x01, 0x0C][..], &[0x42, 0x01, 0x01], &[0x44, 0x01, 0xC1]] {
            rec.push(0x80 | hevc_nal_unit_type(nal[0]));
            rec.extend_from_slice(&1u16.to_be_bytes());
            rec.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            rec.extend_from_slice(nal);
        }
        rec
    }

    #[test]
    fn avcc_to_annexb_basic() {
        // AVCC with 4-byte length: length=5, then 5 bytes of NAL data
        let avcc = [0x00, 0x00, 0x00, 0x05, 0x67, 0x01, 0x02, 0x03, 0x04];
        let annexb = avcc_to_annexb(&avcc, 4).unwrap();
        assert_eq!(&annexb[..4], &ANNEXB_START_CODE);
        assert_eq!(&annexb[4..], &[0x67, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn avcc_truncated_nal_is_an_error() {
        let avcc = [0x00, 0x00, 0x00, 0x09, 0x65, 0x01];
        assert!(matches!(
            avcc_to_annexb(&avcc, 4),
            Err(DemuxError::TruncatedData { expected: 13, got: 6 })
        ));
    }

    #[test]
    fn nal_type_parsing() {
        assert_eq!(nal_unit_type(0x67), H264NalType::Sps);
        assert_eq!(nal_unit_type(0x68), H264NalType::Pps);
        assert_eq!(nal_unit_type(0x65), H264NalType::Idr);
        assert_eq!(nal_unit_type(0x41), H264NalType::Slice);
    }

    #[test]
    fn annexb_scanning_handles_both_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, // 4-byte
            0x00, 0x00, 0x01, 0x68, 0xBB, // 3-byte
            0x00, 0x00, 0x00, 0x01, 0x65, 0xCC, 0xDD,
        ];
        let units = annexb_nal_units(&data);
        let expected: [&[u8]; 3] = [&[0x67, 0xAA], &[0x68, 0xBB], &[0x65, 0xCC, 0xDD]];
        assert_eq!(units, expected);
    }

    #[test]
    fn emulation_prevention_is_stripped() {
        let nal = [0x67, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03];
        assert_eq!(
            remove_emulation_prevention(&nal),
            vec![0x67, 0x00, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn parses_avcc_record() {
        let cfg = AvccConfig::parse(&avcc_record()).unwrap();
        assert_eq!(cfg.length_size(), 4);
        assert_eq!(cfg.sps_list, vec![vec![0x67, 0x42, 0x00, 0x1E]]);
        assert_eq!(cfg.pps_list, vec![vec![0x68, 0xCE]]);
    }

    #[test]
    fn rejects_wrong_avcc_version() {
        let mut rec = avcc_record();
        rec[0] = 2;
        assert!(matches!(
            AvccConfig::parse(&rec),
            Err(DemuxError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn filter_prepends_parameter_sets_on_keyframes() {
        let mut filter = AvccToAnnexB::from_extradata(&avcc_record()).unwrap();
        let idr = Packet::new(vec![0, 0, 0, 2, 0x65, 0x88], Some(0), true);
        let out = filter.filter(idr).unwrap();

        let units = annexb_nal_units(&out.data);
        let types: Vec<_> = units.iter().map(|n| nal_unit_type(n[0])).collect();
        assert_eq!(
            types,
            vec![H264NalType::Sps, H264NalType::Pps, H264NalType::Idr]
        );
        assert_eq!(out.pts, Some(0));
    }

    #[test]
    fn filter_leaves_non_keyframes_alone() {
        let mut filter = AvccToAnnexB::from_extradata(&avcc_record()).unwrap();
        let p = Packet::new(vec![0, 0, 0, 2, 0x41, 0x9A], Some(1), false);
        let out = filter.filter(p).unwrap();
        assert_eq!(out.data, vec![0, 0, 0, 1, 0x41, 0x9A]);
    }

    #[test]
    fn filter_does_not_duplicate_inline_sps() {
        let mut filter = AvccToAnnexB::from_extradata(&avcc_record()).unwrap();
        let idr = Packet::new(
            vec![0, 0, 0, 2, 0x67, 0x42, 0, 0, 0, 2, 0x65, 0x88],
            None,
            true,
        );
        let out = filter.filter(idr).unwrap();
        assert_eq!(annexb_nal_units(&out.data).len(), 2);
    }

    #[test]
    fn parses_hvcc_record() {
        let cfg = HvccConfig::parse(&hvcc_record()).unwrap();
        assert_eq!(cfg.general_profile_idc, 1);
        assert_eq!(cfg.general_level_idc, 93);
        assert_eq!(cfg.length_size(), 4);
        assert_eq!(cfg.parameter_sets.len(), 3);
        assert_eq!(cfg.sps(), Some(&[0x42, 0x01, 0x01][..]));
    }

    #[test]
    fn short_hvcc_record_is_an_error() {
        let rec = hvcc_record();
        assert!(matches!(
            HvccConfig::parse(&rec[..10]),
            Err(DemuxError::TruncatedData { expected: 23, got: 10 })
        ));
        // Array header promises a NAL unit that is not there.
        assert!(HvccConfig::parse(&rec[..rec.len() - 2]).is_err());
    }

    #[test]
    fn hevc_filter_prepends_vps_sps_pps() {
        let mut filter = AvccToAnnexB::from_hvcc(HvccConfig::parse(&hvcc_record()).unwrap());
        assert_eq!(filter.codec(), VideoCodec::H265);
        let idr = Packet::new(vec![0, 0, 0, 3, 0x26, 0x01, 0xAF], Some(0), true);
        let out = filter.filter(idr).unwrap();

        let types: Vec<u8> = annexb_nal_units(&out.data)
            .iter()
            .map(|n| hevc_nal_unit_type(n[0]))
            .collect();
        assert_eq!(types, vec![HEVC_NAL_VPS, HEVC_NAL_SPS, HEVC_NAL_PPS, 19]);
    }

    #[test]
    fn filter_for_stream_picks_framing_by_codec() {
        let mut info = StreamInfo {
            codec: VideoCodec::H264,
            coded: vs_common::Resolution::new(64, 64),
            display: vs_common::Resolution::new(64, 64),
            chroma_format: vs_common::ChromaFormat::Yuv420,
            bit_depth: 8,
            field_order: vs_common::FieldOrder::Progressive,
            time_base: vs_common::Rational::new(1, 90_000),
            frame_rate: None,
            video_stream_index: 0,
            extra_data: Vec::new(),
        };
        assert!(filter_for_stream(&info).unwrap().is_none());

        info.extra_data = avcc_record();
        assert!(filter_for_stream(&info).unwrap().is_some());

        info.codec = VideoCodec::H265;
        info.extra_data = hvcc_record();
        assert!(filter_for_stream(&info).unwrap().is_some());

        info.codec = VideoCodec::Vp9;
        assert!(filter_for_stream(&info).unwrap().is_none());
    }
}
