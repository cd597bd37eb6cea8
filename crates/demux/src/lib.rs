//! `vs-demux` — Compressed input for the decode pipeline.
//!
//! Reads Annex-B H.264/HEVC (and other raw) streams in chunks, demuxes
//! MP4/QuickTime files sample by sample, probes the H.264 and HEVC SPS
//! for geometry, and provides the length-prefixed to Annex-B bitstream
//! filter for container sources.

pub mod bitreader;
pub mod elementary;
pub mod mp4;
pub mod nal;
pub mod probe;
pub mod source;

pub use elementary::ElementaryStreamDemuxer;
pub use mp4::Mp4Demuxer;
pub use nal::{filter_for_stream, AvccConfig, AvccToAnnexB, HvccConfig};
pub use probe::{
    detect_codec, parse_h264_sps, parse_h265_sps, probe_elementary, SpsInfo, StreamOverrides,
};
pub use source::{is_iso_bmff, open_source};
