//! Data flow types — demuxer output, decode-engine callback payloads.

use crate::codec::{ChromaFormat, FieldOrder, VideoCodec};
use crate::types::{Rational, Resolution};

/// Compressed packet read from the demuxer.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    /// Compressed payload (container-native or Annex-B framing).
    pub data: Vec<u8>,
    /// Presentation timestamp in the stream time base, if known.
    pub pts: Option<i64>,
    /// Whether this packet starts a random access point.
    pub is_keyframe: bool,
    /// Container stream the packet belongs to.
    pub stream_index: usize,
}

impl Packet {
    pub fn new(data: Vec<u8>, pts: Option<i64>, is_keyframe: bool) -> Self {
        Self {
            data,
            pts,
            is_keyframe,
            stream_index: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Video stream description produced when the demuxer opens a source.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub codec: VideoCodec,
    /// Coded size (macroblock/CTU aligned).
    pub coded: Resolution,
    /// Display size (cropped).
    pub display: Resolution,
    pub chroma_format: ChromaFormat,
    /// Luma bit depth (8 for 8-bit content).
    pub bit_depth: u8,
    pub field_order: FieldOrder,
    /// Time base of packet timestamps. Invalid (0/x) when unknown.
    pub time_base: Rational,
    pub frame_rate: Option<Rational>,
    /// Index of the video stream inside the container.
    pub video_stream_index: usize,
    /// Codec configuration record (avcC/hvcC) when the container has one.
    pub extra_data: Vec<u8>,
}

impl StreamInfo {
    /// The sequence format the decode engine is expected to report.
    pub fn sequence_format(&self) -> SequenceFormat {
        SequenceFormat {
            codec: self.codec,
            coded: self.coded,
            chroma_format: self.chroma_format,
            bit_depth: self.bit_depth,
            progressive: self.field_order.is_progressive(),
            min_surfaces: 0,
        }
    }
}

/// Sequence header information reported by the decode engine's
/// "sequence changed" callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceFormat {
    pub codec: VideoCodec,
    pub coded: Resolution,
    pub chroma_format: ChromaFormat,
    /// Luma bit depth.
    pub bit_depth: u8,
    pub progressive: bool,
    /// Minimum number of decode surfaces the engine needs (0 = unknown).
    pub min_surfaces: u32,
}

impl SequenceFormat {
    /// Whether `other` describes the same decoder configuration
    /// (codec, coded resolution, chroma format and bit depth).
    pub fn same_configuration(&self, other: &SequenceFormat) -> bool {
        self.codec == other.codec
            && self.coded == other.coded
            && self.chroma_format == other.chroma_format
            && self.bit_depth == other.bit_depth
    }
}

/// Which part of a picture a decode callback covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldRole {
    /// Full frame (progressive or frame-coded interlaced).
    #[default]
    Frame,
    /// First field of a field pair.
    FirstField,
    /// Second field of a field pair, decoded into the same surface.
    SecondField,
}

/// Payload of the "picture ready to decode" callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureParams {
    /// Surface index chosen by the engine.
    pub slot: usize,
    pub field: FieldRole,
    pub keyframe: bool,
}

impl PictureParams {
    pub fn frame(slot: usize) -> Self {
        Self {
            slot,
            field: FieldRole::Frame,
            keyframe: false,
        }
    }
}

/// Payload of the "picture ready to display" callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayMetadata {
    /// Presentation timestamp in the engine clock, if known.
    pub timestamp: Option<i64>,
    pub progressive: bool,
    pub top_field_first: bool,
    /// Number of times the first field is repeated (0 or 1 for
    /// interlaced pulldown).
    pub repeat_first_field: u32,
}

impl DisplayMetadata {
    pub fn progressive(timestamp: Option<i64>) -> Self {
        Self {
            timestamp,
            progressive: true,
            top_field_first: false,
            repeat_first_field: 0,
        }
    }

    pub fn interlaced(timestamp: Option<i64>, top_field_first: bool, repeat_first_field: u32) -> Self {
        Self {
            timestamp,
            progressive: false,
            top_field_first,
            repeat_first_field,
        }
    }
}
