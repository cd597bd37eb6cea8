//! Raw bindings for the CUVID parser and NVDEC decoder (`nvcuvid`).
//!
//! The library is opened at runtime with `libloading`, so the crate builds
//! and its tests run on machines without an NVIDIA driver. Only the entry
//! points the engine drives are bound: parser lifecycle, picture decode and
//! per-field surface mapping.
//!
//! Layouts follow `nvcuvid.h` / `cuviddec.h` from the Video Codec SDK.
//! Fields declared `unsigned long` in C use `c_ulong`, which is 64-bit on
//! Linux and 32-bit on Windows.

use std::ffi::{c_ulong, c_void};
use std::path::Path;

use libloading::Library;
use tracing::{debug, info};

use vs_common::{ChromaFormat, DeinterlaceMode, VideoCodec};

// ---------------------------------------------------------------------------
// Scalar and handle types
// ---------------------------------------------------------------------------

pub type CUresult = i32;
pub const CUDA_SUCCESS: CUresult = 0;

/// GPU virtual address.
pub type CUdeviceptr = u64;
pub type CUstream = *mut c_void;

pub type CUvideodecoder = *mut c_void;
pub type CUvideoparser = *mut c_void;
pub type CUvideoctxlock = *mut c_void;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// `cudaVideoCodec`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoCodec {
    Mpeg1 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    Vc1 = 3,
    H264 = 4,
    Jpeg = 5,
    H264Svc = 6,
    H264Mvc = 7,
    Hevc = 8,
    Vp8 = 9,
    Vp9 = 10,
    Av1 = 11,
}

impl CudaVideoCodec {
    pub fn from_common(codec: VideoCodec) -> Option<Self> {
        Some(match codec {
            VideoCodec::Mpeg1 => Self::Mpeg1,
            VideoCodec::Mpeg2 => Self::Mpeg2,
            VideoCodec::Mpeg4 => Self::Mpeg4,
            VideoCodec::Vc1 => Self::Vc1,
            VideoCodec::H264 => Self::H264,
            VideoCodec::H265 => Self::Hevc,
            VideoCodec::Jpeg => Self::Jpeg,
            VideoCodec::Vp9 => Self::Vp9,
            VideoCodec::Av1 => Self::Av1,
        })
    }

    /// Inverse of [`from_common`](Self::from_common). SVC/MVC report as H.264.
    pub fn to_common(self) -> Option<VideoCodec> {
        match self {
            Self::Mpeg1 => Some(VideoCodec::Mpeg1),
            Self::Mpeg2 => Some(VideoCodec::Mpeg2),
            Self::Mpeg4 => Some(VideoCodec::Mpeg4),
            Self::Vc1 => Some(VideoCodec::Vc1),
            Self::H264 | Self::H264Svc | Self::H264Mvc => Some(VideoCodec::H264),
            Self::Hevc => Some(VideoCodec::H265),
            Self::Jpeg => Some(VideoCodec::Jpeg),
            Self::Vp9 => Some(VideoCodec::Vp9),
            Self::Av1 => Some(VideoCodec::Av1),
            Self::Vp8 => None,
        }
    }
}

/// `cudaVideoSurfaceFormat`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoSurfaceFormat {
    Nv12 = 0,
    P016 = 1,
    Yuv444 = 2,
    Yuv444_16Bit = 3,
}

/// `cudaVideoDeinterlaceMode`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoDeinterlaceMode {
    Weave = 0,
    Bob = 1,
    Adaptive = 2,
}

impl From<DeinterlaceMode> for CudaVideoDeinterlaceMode {
    fn from(mode: DeinterlaceMode) -> Self {
        match mode {
            DeinterlaceMode::Weave => Self::Weave,
            DeinterlaceMode::Bob => Self::Bob,
            DeinterlaceMode::Adaptive => Self::Adaptive,
        }
    }
}

/// `cudaVideoChromaFormat`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoChromaFormat {
    Monochrome = 0,
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl From<CudaVideoChromaFormat> for ChromaFormat {
    fn from(chroma: CudaVideoChromaFormat) -> Self {
        match chroma {
            CudaVideoChromaFormat::Monochrome => ChromaFormat::Monochrome,
            CudaVideoChromaFormat::Yuv420 => ChromaFormat::Yuv420,
            CudaVideoChromaFormat::Yuv422 => ChromaFormat::Yuv422,
            CudaVideoChromaFormat::Yuv444 => ChromaFormat::Yuv444,
        }
    }
}

/// `cudaVideoCreateFlags` values for `ulCreationFlags`.
pub mod create_flags {
    pub const DEFAULT: u32 = 0x00;
    /// Post-process on CUDA instead of the dedicated video engine.
    pub const PREFER_CUDA: u32 = 0x01;
    pub const PREFER_DXVA: u32 = 0x02;
    pub const PREFER_CUVID: u32 = 0x04;
}

// ---------------------------------------------------------------------------
// Rectangles
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortRect {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IntRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl IntRect {
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

// ---------------------------------------------------------------------------
// CUVIDDECODECREATEINFO
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone)]
pub struct CuvidDecodeCreateInfo {
    pub width: c_ulong,
    pub height: c_ulong,
    pub num_decode_surfaces: c_ulong,
    pub codec_type: CudaVideoCodec,
    pub chroma_format: CudaVideoChromaFormat,
    pub creation_flags: c_ulong,
    pub bit_depth_minus8: c_ulong,
    pub intra_decode_only: c_ulong,
    pub max_width: c_ulong,
    pub max_height: c_ulong,
    pub reserved1: c_ulong,
    pub display_area: ShortRect,
    pub output_format: CudaVideoSurfaceFormat,
    pub deinterlace_mode: CudaVideoDeinterlaceMode,
    pub target_width: c_ulong,
    pub target_height: c_ulong,
    /// Surfaces that may be mapped at the same time.
    pub num_output_surfaces: c_ulong,
    pub vid_lock: CUvideoctxlock,
    pub target_rect: ShortRect,
    pub enable_histogram: c_ulong,
    pub reserved2: [c_ulong; 4],
}

impl Default for CuvidDecodeCreateInfo {
    fn default() -> Self {
        // SAFETY: every field is an integer, a C enum whose zero value is a
        // declared variant, or a nullable pointer.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDPICPARAMS (header only)
// ---------------------------------------------------------------------------

/// Leading fields of `CUVIDPICPARAMS`.
///
/// The parser fills and owns this struct; the engine only reads the header
/// and passes the pointer through to `cuvidDecodePicture`, so the
/// codec-specific union is never declared.
#[repr(C)]
pub struct CuvidPicParams {
    pub pic_width_in_mbs: i32,
    pub frame_height_in_mbs: i32,
    /// Decode surface index chosen by the parser.
    pub curr_pic_idx: i32,
    pub field_pic_flag: i32,
    pub bottom_field_flag: i32,
    pub second_field: i32,
    pub bitstream_data_len: u32,
    pub bitstream_data: *const u8,
    pub num_slices: u32,
    pub slice_data_offsets: *const u32,
    pub ref_pic_flag: i32,
    pub intra_pic_flag: i32,
}

// ---------------------------------------------------------------------------
// CUVIDPROCPARAMS
// ---------------------------------------------------------------------------

/// Per-map post-processing parameters.
#[repr(C)]
#[derive(Clone)]
pub struct CuvidProcParams {
    pub progressive_frame: i32,
    /// Field selector: 0 for the first field, 1 (or 2 for a repeat) after.
    pub second_field: i32,
    pub top_field_first: i32,
    /// Set when the picture carries a single field.
    pub unpaired_field: i32,
    pub reserved_flags: u32,
    pub reserved_zero: u32,
    pub raw_input_dptr: u64,
    pub raw_input_pitch: u32,
    pub raw_input_format: u32,
    pub raw_output_dptr: u64,
    pub raw_output_pitch: u32,
    pub raw_output_format: u32,
    pub output_stream: CUstream,
    pub reserved: [u32; 46],
    pub histogram_dptr: *mut u64,
    pub reserved2: [*mut c_void; 1],
}

impl Default for CuvidProcParams {
    fn default() -> Self {
        // SAFETY: integers and nullable pointers only.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDEOFORMAT
// ---------------------------------------------------------------------------

/// Sequence information handed to the sequence callback.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct CuVideoFormat {
    pub codec: CudaVideoCodec,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub progressive_sequence: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub min_num_decode_surfaces: u8,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: IntRect,
    pub chroma_format: CudaVideoChromaFormat,
    pub bitrate: u32,
    pub display_aspect_ratio_x: i32,
    pub display_aspect_ratio_y: i32,
    /// Packed `video_signal_description` bytes.
    pub video_signal_description: [u8; 4],
    pub seqhdr_data_length: u32,
}

impl Default for CuVideoFormat {
    fn default() -> Self {
        // SAFETY: zero is a declared variant of both enums.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDPARSERDISPINFO
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct CuvidParserDispInfo {
    pub picture_index: i32,
    pub progressive_frame: i32,
    pub top_field_first: i32,
    /// Extra fields to present: 0, 1 (3:2 pulldown) or 2 (frame tripling).
    pub repeat_first_field: i32,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Parser callbacks and CUVIDPARSERPARAMS
// ---------------------------------------------------------------------------

/// Returns 0 to fail, 1 to accept, or a surface count (> 1) that overrides
/// `max_num_decode_surfaces`.
pub type PfnSequenceCallback =
    unsafe extern "C" fn(user_data: *mut c_void, format: *mut CuVideoFormat) -> i32;

/// Returns 1 on success, 0 to abort parsing.
pub type PfnDecodePicture =
    unsafe extern "C" fn(user_data: *mut c_void, pic_params: *mut CuvidPicParams) -> i32;

/// Returns 1 on success, 0 to abort parsing. `disp_info` may be null on flush.
pub type PfnDisplayPicture =
    unsafe extern "C" fn(user_data: *mut c_void, disp_info: *mut CuvidParserDispInfo) -> i32;

/// Optional callbacks the engine never registers.
pub type PfnUnused = unsafe extern "C" fn(user_data: *mut c_void, data: *mut c_void) -> i32;

#[repr(C)]
pub struct CuvidParserParams {
    pub codec_type: CudaVideoCodec,
    pub max_num_decode_surfaces: u32,
    /// Timestamp units per second (0 means 10 MHz).
    pub clock_rate: u32,
    /// Percentage of corrupted macroblocks tolerated before a picture is dropped.
    pub error_threshold: u32,
    /// Pictures held back before the display callback (reorder depth).
    pub max_display_delay: u32,
    /// `bAnnexb:1`, `bMemoryOptimize:1`, reserved bits.
    pub flags: u32,
    pub reserved1: [u32; 4],
    pub user_data: *mut c_void,
    pub pfn_sequence_callback: Option<PfnSequenceCallback>,
    pub pfn_decode_picture: Option<PfnDecodePicture>,
    pub pfn_display_picture: Option<PfnDisplayPicture>,
    pub pfn_get_operating_point: Option<PfnUnused>,
    pub pfn_get_sei_msg: Option<PfnUnused>,
    pub reserved2: [*mut c_void; 5],
    pub ext_video_info: *mut c_void,
}

impl Default for CuvidParserParams {
    fn default() -> Self {
        // SAFETY: null user data and `None` callbacks are valid.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDSOURCEDATAPACKET
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct CuvidSourceDataPacket {
    pub flags: c_ulong,
    pub payload_size: c_ulong,
    pub payload: *const u8,
    pub timestamp: i64,
}

impl CuvidSourceDataPacket {
    /// Payload packet. `data` must outlive the `cuvidParseVideoData` call.
    pub fn payload(data: &[u8], timestamp: Option<i64>) -> Self {
        let mut flags = 0;
        if timestamp.is_some() {
            flags |= packet_flags::TIMESTAMP;
        }
        Self {
            flags: flags as c_ulong,
            payload_size: data.len() as c_ulong,
            payload: data.as_ptr(),
            timestamp: timestamp.unwrap_or(0),
        }
    }

    /// Empty packet flagging end of stream; the parser emits every pending
    /// display callback before returning.
    pub fn end_of_stream() -> Self {
        Self {
            flags: (packet_flags::END_OF_STREAM | packet_flags::NOTIFY_EOS) as c_ulong,
            payload_size: 0,
            payload: std::ptr::null(),
            timestamp: 0,
        }
    }
}

/// `CUvideopacketflags`.
pub mod packet_flags {
    pub const END_OF_STREAM: u32 = 0x01;
    pub const TIMESTAMP: u32 = 0x02;
    pub const DISCONTINUITY: u32 = 0x04;
    pub const END_OF_PICTURE: u32 = 0x08;
    /// Also deliver a null display callback after the flush.
    pub const NOTIFY_EOS: u32 = 0x10;
}

// ---------------------------------------------------------------------------
// Dynamic library
// ---------------------------------------------------------------------------

/// Function table resolved from `nvcuvid`.
#[allow(non_snake_case)]
pub struct NvcuvidLibrary {
    /// Keeps the symbols below valid.
    _lib: Library,

    pub cuvidCreateDecoder:
        unsafe extern "C" fn(*mut CUvideodecoder, *mut CuvidDecodeCreateInfo) -> CUresult,
    pub cuvidDestroyDecoder: unsafe extern "C" fn(CUvideodecoder) -> CUresult,
    pub cuvidDecodePicture: unsafe extern "C" fn(CUvideodecoder, *mut CuvidPicParams) -> CUresult,
    pub cuvidMapVideoFrame64: unsafe extern "C" fn(
        CUvideodecoder,
        i32,
        *mut CUdeviceptr,
        *mut u32,
        *mut CuvidProcParams,
    ) -> CUresult,
    pub cuvidUnmapVideoFrame64: unsafe extern "C" fn(CUvideodecoder, CUdeviceptr) -> CUresult,

    pub cuvidCreateVideoParser:
        unsafe extern "C" fn(*mut CUvideoparser, *mut CuvidParserParams) -> CUresult,
    pub cuvidDestroyVideoParser: unsafe extern "C" fn(CUvideoparser) -> CUresult,
    pub cuvidParseVideoData:
        unsafe extern "C" fn(CUvideoparser, *mut CuvidSourceDataPacket) -> CUresult,
}

// SAFETY: the table holds plain function pointers into a library that stays
// loaded for the table's lifetime. The driver entry points are thread-safe.
unsafe impl Send for NvcuvidLibrary {}
unsafe impl Sync for NvcuvidLibrary {}

impl std::fmt::Debug for NvcuvidLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvcuvidLibrary").finish_non_exhaustive()
    }
}

/// Copy one typed symbol out of `lib`.
///
/// # Safety
///
/// `T` must be the exact function pointer type of `name`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T, NvcuvidLoadError> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    lib.get::<T>(&bytes)
        .map(|sym| *sym)
        .map_err(|e| NvcuvidLoadError::SymbolNotFound(format!("{name}: {e}")))
}

impl NvcuvidLibrary {
    /// Load the driver's `nvcuvid` from the system search path.
    pub fn load() -> Result<Self, NvcuvidLoadError> {
        let name = Self::library_name();
        info!(library = name, "Loading NVDEC library");

        // SAFETY: loading the NVIDIA driver library runs no user-visible
        // initialisation beyond registering its entry points.
        let lib = unsafe { Library::new(name) }.map_err(|e| {
            NvcuvidLoadError::LibraryNotFound(format!(
                "{name}: {e}. Is the NVIDIA driver installed?"
            ))
        })?;
        Self::from_library(lib)
    }

    /// Load from an explicit path (non-standard driver installs).
    pub fn load_from(path: &Path) -> Result<Self, NvcuvidLoadError> {
        info!(path = %path.display(), "Loading NVDEC library from custom path");

        // SAFETY: the caller names an nvcuvid build; see `load`.
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            NvcuvidLoadError::LibraryNotFound(format!("{}: {e}", path.display()))
        })?;
        Self::from_library(lib)
    }

    fn from_library(lib: Library) -> Result<Self, NvcuvidLoadError> {
        // SAFETY: each type below matches the prototype in the SDK headers.
        // The copied pointers stay valid because `lib` moves into the table.
        unsafe {
            let table = Self {
                cuvidCreateDecoder: symbol(&lib, "cuvidCreateDecoder")?,
                cuvidDestroyDecoder: symbol(&lib, "cuvidDestroyDecoder")?,
                cuvidDecodePicture: symbol(&lib, "cuvidDecodePicture")?,
                cuvidMapVideoFrame64: symbol(&lib, "cuvidMapVideoFrame64")?,
                cuvidUnmapVideoFrame64: symbol(&lib, "cuvidUnmapVideoFrame64")?,
                cuvidCreateVideoParser: symbol(&lib, "cuvidCreateVideoParser")?,
                cuvidDestroyVideoParser: symbol(&lib, "cuvidDestroyVideoParser")?,
                cuvidParseVideoData: symbol(&lib, "cuvidParseVideoData")?,
                _lib: lib,
            };
            debug!("NVDEC symbols resolved");
            Ok(table)
        }
    }

    fn library_name() -> &'static str {
        if cfg!(target_os = "windows") {
            "nvcuvid.dll"
        } else {
            "libnvcuvid.so.1"
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NvcuvidLoadError {
    #[error("NVDEC library not found: {0}")]
    LibraryNotFound(String),

    #[error("Required symbol not found: {0}")]
    SymbolNotFound(String),
}

/// Map a CUVID status to `Err` carrying the call name and code.
pub fn check_cuvid_result(result: CUresult, call: &str) -> Result<(), String> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(format!("{call} failed with error code {result}"))
    }
}
