//! MP4 / QuickTime (ISO BMFF) demuxer.
//!
//! Every track's samples are yielded in file order, so audio and other
//! tracks interleaved with the video arrive under their own stream index.
//! Video packets keep their length-prefixed framing and carry the
//! composition timestamp in the track timescale; the avcC/hvcC record is
//! handed on as `StreamInfo::extra_data` for [`crate::filter_for_stream`].

pub mod boxes;
pub mod sample;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, info, warn};
use vs_common::{
    ChromaFormat, DemuxError, Demuxer, FieldOrder, Packet, Rational, Resolution, StreamInfo,
    VideoCodec,
};

use crate::nal::{AvccConfig, HvccConfig};
use crate::probe::{parse_h264_sps, parse_h265_sps, SpsInfo};
use boxes::{
    find_and_parse_moov, fourcc_to_string, Mp4Track, AV01, AVC1, AVC3, HEV1, HVC1, MP4V, VP09,
};
use sample::{build_sample_table, SampleEntry};

/// Largest buffer reserved ahead of a sample read.
const MAX_PREALLOC: usize = 16 << 20;

pub struct Mp4Demuxer<R = BufReader<File>> {
    reader: R,
    info: StreamInfo,
    /// (track index, sample) for every track, sorted by file offset.
    schedule: Vec<(usize, SampleEntry)>,
    next: usize,
    video_samples: usize,
    bytes_read: u64,
}

impl Mp4Demuxer {
    pub fn open(path: &Path) -> Result<Self, DemuxError> {
        let file = File::open(path)?;
        let demuxer = Self::from_reader(BufReader::new(file))?;
        info!(
            path = %path.display(),
            codec = demuxer.info.codec.display_name(),
            coded = %demuxer.info.coded,
            samples = demuxer.video_samples,
            time_base = %demuxer.info.time_base,
            "Opened MP4"
        );
        Ok(demuxer)
    }
}

impl<R: Read + Seek> Mp4Demuxer<R> {
    /// Parse the moov box and index every track's samples. The first
    /// video track is the one described by `stream_info`.
    pub fn from_reader(mut reader: R) -> Result<Self, DemuxError> {
        let tracks = find_and_parse_moov(&mut reader)?;
        let video_index = tracks
            .iter()
            .position(Mp4Track::is_video)
            .ok_or(DemuxError::NoVideoTrack)?;
        let info = video_stream_info(&tracks[video_index], video_index)?;

        let mut schedule = Vec::new();
        let mut video_samples = 0;
        for (index, track) in tracks.iter().enumerate() {
            match build_sample_table(track) {
                Ok(samples) => {
                    if index == video_index {
                        video_samples = samples.len();
                    }
                    schedule.extend(samples.into_iter().map(|s| (index, s)));
                }
                Err(e) if index != video_index => {
                    warn!(track = index, "Ignoring track with unusable sample table: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        // Stable sort: samples of one track keep decode order.
        schedule.sort_by_key(|(_, sample)| sample.offset);
        debug!(
            tracks = tracks.len(),
            video_track = video_index,
            video_samples,
            total_samples = schedule.len(),
            "Indexed MP4 samples"
        );

        Ok(Self {
            reader,
            info,
            schedule,
            next: 0,
            video_samples,
            bytes_read: 0,
        })
    }

    /// Samples of the video track.
    pub fn video_samples(&self) -> usize {
        self.video_samples
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: Read + Seek + Send> Demuxer for Mp4Demuxer<R> {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        let Some(&(track, sample)) = self.schedule.get(self.next) else {
            debug!(bytes = self.bytes_read, "End of MP4 samples");
            return Ok(None);
        };
        self.next += 1;

        self.reader.seek(SeekFrom::Start(sample.offset))?;
        let size = sample.size as usize;
        let mut data = Vec::with_capacity(size.min(MAX_PREALLOC));
        (&mut self.reader)
            .take(sample.size as u64)
            .read_to_end(&mut data)?;
        if data.len() != size {
            return Err(DemuxError::TruncatedData {
                expected: size,
                got: data.len(),
            });
        }
        self.bytes_read += data.len() as u64;

        Ok(Some(Packet {
            data,
            pts: Some(sample.cts),
            is_keyframe: sample.is_sync,
            stream_index: track,
        }))
    }
}

impl<R> std::fmt::Debug for Mp4Demuxer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mp4Demuxer")
            .field("codec", &self.info.codec)
            .field("video_track", &self.info.video_stream_index)
            .field("next", &self.next)
            .field("samples", &self.schedule.len())
            .finish()
    }
}

fn codec_from_fourcc(fourcc: u32) -> Result<VideoCodec, DemuxError> {
    match fourcc {
        AVC1 | AVC3 => Ok(VideoCodec::H264),
        HVC1 | HEV1 => Ok(VideoCodec::H265),
        MP4V => Err(DemuxError::UnsupportedVideoCodec(VideoCodec::Mpeg4)),
        VP09 => Err(DemuxError::UnsupportedVideoCodec(VideoCodec::Vp9)),
        AV01 => Err(DemuxError::UnsupportedVideoCodec(VideoCodec::Av1)),
        other => Err(DemuxError::UnsupportedContainer(format!(
            "video sample entry '{}'",
            fourcc_to_string(other)
        ))),
    }
}

/// Stream description of a video track. Geometry comes from the SPS in
/// the configuration record, the sample entry's size being only a
/// fallback for records without one.
fn video_stream_info(track: &Mp4Track, index: usize) -> Result<StreamInfo, DemuxError> {
    let desc = track.video.as_ref().ok_or_else(|| DemuxError::InvalidStructure {
        offset: 0,
        reason: format!("video track {} has no sample description", track.track_id),
    })?;
    let codec = codec_from_fourcc(desc.codec_fourcc)?;
    let config = desc.config.clone().ok_or_else(|| DemuxError::InvalidStructure {
        offset: 0,
        reason: format!("'{}' entry without a configuration record", fourcc_to_string(desc.codec_fourcc)),
    })?;

    let sps: Option<SpsInfo> = match codec {
        VideoCodec::H265 => HvccConfig::parse(&config)?.sps().map(parse_h265_sps).transpose()?,
        _ => AvccConfig::parse(&config)?
            .sps_list
            .first()
            .map(|nal| parse_h264_sps(nal))
            .transpose()?,
    };

    let entry_size = Resolution::new(desc.width as u32, desc.height as u32);
    let (coded, display, chroma_format, bit_depth, field_order) = match &sps {
        Some(sps) => (
            sps.coded,
            sps.display,
            ChromaFormat::from_idc(sps.chroma_format_idc).unwrap_or_default(),
            sps.bit_depth,
            if sps.frame_mbs_only {
                FieldOrder::Progressive
            } else {
                FieldOrder::Unknown
            },
        ),
        None => (entry_size, entry_size, ChromaFormat::Yuv420, 8, FieldOrder::Unknown),
    };
    if coded.width == 0 || coded.height == 0 {
        return Err(DemuxError::MissingDimensions(codec));
    }

    let time_base = if track.timescale > 0 {
        Rational::from_clock_rate(track.timescale)
    } else {
        Rational { num: 0, den: 1 }
    };

    Ok(StreamInfo {
        codec,
        coded,
        display,
        chroma_format,
        bit_depth,
        field_order,
        time_base,
        frame_rate: frame_rate(track),
        video_stream_index: index,
        extra_data: config,
    })
}

/// Frame rate from the dominant stts delta, reduced.
fn frame_rate(track: &Mp4Track) -> Option<Rational> {
    let delta = track
        .stts
        .iter()
        .max_by_key(|entry| entry.sample_count)?
        .sample_delta;
    if delta == 0 || track.timescale == 0 {
        return None;
    }
    let g = gcd(track.timescale, delta);
    Some(Rational::new(track.timescale / g, delta / g))
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
