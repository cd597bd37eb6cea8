//! Video codec, chroma format and field order enums.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Mpeg1,
    Mpeg2,
    Mpeg4,
    Vc1,
    H264,
    H265,
    Jpeg,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Human-readable codec name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Mpeg1 => "MPEG-1",
            Self::Mpeg2 => "MPEG-2",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::Vc1 => "VC-1",
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
            Self::Jpeg => "Motion JPEG",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
        }
    }

    /// Codecs the hardware decodes more reliably through the CUDA
    /// (shader) path than the dedicated video engine.
    pub fn prefers_cuda_path(self) -> bool {
        matches!(self, Self::Jpeg | Self::Mpeg2)
    }

    /// File extensions used for raw elementary streams of this codec.
    pub fn elementary_extensions(self) -> &'static [&'static str] {
        match self {
            Self::H264 => &["h264", "264", "avc"],
            Self::H265 => &["h265", "265", "hevc"],
            Self::Mpeg2 => &["m2v", "mpv"],
            Self::Mpeg1 => &["m1v"],
            Self::Mpeg4 => &["m4v"],
            Self::Vc1 => &["vc1"],
            Self::Jpeg => &["mjpeg", "mjpg"],
            Self::Vp9 => &["ivf"],
            Self::Av1 => &["obu"],
        }
    }

    /// Look up a codec from an elementary-stream file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        const ALL: [VideoCodec; 9] = [
            VideoCodec::H264,
            VideoCodec::H265,
            VideoCodec::Mpeg2,
            VideoCodec::Mpeg1,
            VideoCodec::Mpeg4,
            VideoCodec::Vc1,
            VideoCodec::Jpeg,
            VideoCodec::Vp9,
            VideoCodec::Av1,
        ];
        ALL.into_iter()
            .find(|codec| codec.elementary_extensions().contains(&ext.as_str()))
    }
}

/// Chroma subsampling of the coded stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    /// Map an H.264/HEVC `chroma_format_idc`.
    pub fn from_idc(idc: u32) -> Option<Self> {
        match idc {
            0 => Some(Self::Monochrome),
            1 => Some(Self::Yuv420),
            2 => Some(Self::Yuv422),
            3 => Some(Self::Yuv444),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Monochrome => "Monochrome",
            Self::Yuv420 => "4:2:0",
            Self::Yuv422 => "4:2:2",
            Self::Yuv444 => "4:4:4",
        }
    }
}

/// Scan type of the sequence as reported by the container.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldOrder {
    #[default]
    Progressive,
    TopFieldFirst,
    BottomFieldFirst,
    /// Container did not say; treated as progressive.
    Unknown,
}

impl FieldOrder {
    pub fn is_progressive(self) -> bool {
        matches!(self, Self::Progressive | Self::Unknown)
    }
}
