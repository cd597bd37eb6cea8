//! NVDEC decode engine.
//!
//! `NvDecEngine` owns a CUVID video parser and the NVDEC decoder it feeds.
//! Compressed packets go in through [`DecodeEngine::feed`]; the parser calls
//! back synchronously from inside `cuvidParseVideoData`:
//!
//! 1. **sequence**: the stream format is offered to the synchronizer, and
//!    on acceptance the decoder is created with one decode surface per
//!    pool slot.
//! 2. **decode**: the synchronizer acquires the target slot (this may block
//!    until the consumer releases it), then the picture is decoded.
//! 3. **display**: the slot is handed to the synchronizer in display order.
//!
//! ## Locking
//!
//! Two locks, never nested:
//!
//! - the parser lock serializes `feed`/`flush` and is held while callbacks
//!   run on the feeding thread;
//! - the decoder lock guards the decoder handle and is held only for the
//!   duration of one NVDEC call (create, decode, map, unmap).
//!
//! The decode callback asks the synchronizer for the slot *before* taking
//! the decoder lock, so a parser blocked on backpressure never stops the
//! consumer from mapping and unmapping surfaces.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cudarc::driver::safe::CudaContext;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use vs_common::{
    DecodeCallbacks, DecodeDecision, DecodeEngine, DecodeError, DeinterlaceMode, DisplayMetadata,
    FeedStatus, FieldPass, FieldRole, Packet, PictureParams, Resolution, SequenceFormat,
    SessionConfig, StreamInfo, SurfaceView, VideoCodec,
};

use super::ffi::{
    check_cuvid_result, create_flags, packet_flags, CUvideodecoder, CUvideoparser,
    CuVideoFormat, CudaVideoCodec, CudaVideoDeinterlaceMode, CudaVideoSurfaceFormat,
    CuvidDecodeCreateInfo, CuvidParserDispInfo, CuvidParserParams, CuvidPicParams,
    CuvidProcParams, CuvidSourceDataPacket, NvcuvidLibrary, ShortRect, CUDA_SUCCESS,
};

/// Surfaces NVDEC keeps mapped at once. The consumer maps one pass at a time.
const OUTPUT_SURFACES: u32 = 2;

// ---------------------------------------------------------------------------
// Decoder state (decoder lock)
// ---------------------------------------------------------------------------

struct DecoderState {
    decoder: CUvideodecoder,
    /// Output (display area) size of mapped surfaces.
    output: Resolution,
    pictures_decoded: u64,
}

// SAFETY: the decoder handle is only dereferenced by NVDEC calls made while
// the owning Mutex is held.
unsafe impl Send for DecoderState {}

impl DecoderState {
    fn new() -> Self {
        Self {
            decoder: ptr::null_mut(),
            output: Resolution::new(0, 0),
            pictures_decoded: 0,
        }
    }

    fn destroy(&mut self, lib: &NvcuvidLibrary) {
        if self.decoder.is_null() {
            return;
        }
        // SAFETY: the handle came from cuvidCreateDecoder and no surface of
        // it is mapped once the parser is gone.
        let result = unsafe { (lib.cuvidDestroyDecoder)(self.decoder) };
        if result != CUDA_SUCCESS {
            error!(error_code = result, "Failed to destroy NVDEC decoder");
        }
        self.decoder = ptr::null_mut();
    }
}

// ---------------------------------------------------------------------------
// Parser callback context
// ---------------------------------------------------------------------------

/// Everything the C callbacks need. Boxed so `user_data` stays stable for
/// the parser's lifetime.
struct CallbackContext {
    lib: Arc<NvcuvidLibrary>,
    callbacks: Arc<dyn DecodeCallbacks>,
    decoder: Arc<Mutex<DecoderState>>,
    capacity: usize,
    deinterlace: CudaVideoDeinterlaceMode,
    /// Set when the synchronizer refused a callback. Sticky.
    rejected: AtomicBool,
    /// Whether any packet carried a pts; otherwise display timestamps are
    /// parser fill-ins and are reported as unknown.
    timestamps: AtomicBool,
    last_error: Mutex<Option<DecodeError>>,
}

impl CallbackContext {
    fn reject(&self) -> i32 {
        self.rejected.store(true, Ordering::Release);
        0
    }

    fn fail(&self, err: DecodeError) -> i32 {
        error!("{err}");
        *self.last_error.lock() = Some(err);
        0
    }

    fn sequence(&self, fmt: &CuVideoFormat) -> i32 {
        let Some(codec) = fmt.codec.to_common() else {
            return self.fail(DecodeError::Gpu(format!(
                "parser reported unsupported codec {:?}",
                fmt.codec
            )));
        };
        let format = SequenceFormat {
            codec,
            coded: Resolution::new(fmt.coded_width, fmt.coded_height),
            chroma_format: fmt.chroma_format.into(),
            bit_depth: 8 + fmt.bit_depth_luma_minus8,
            progressive: fmt.progressive_sequence != 0,
            min_surfaces: u32::from(fmt.min_num_decode_surfaces),
        };

        let capacity = match self.callbacks.on_sequence_format(&format) {
            Ok(capacity) => capacity.min(self.capacity),
            Err(e) => {
                warn!("Sequence rejected: {e}");
                return self.reject();
            }
        };
        if format.min_surfaces as usize > capacity {
            return self.fail(DecodeError::InsufficientSurfaces {
                required: format.min_surfaces,
                available: capacity,
            });
        }

        let mut state = self.decoder.lock();
        if !state.decoder.is_null() {
            // Accepted formats never change geometry or depth, so the decoder is kept.
            debug!("Repeated sequence header, reusing decoder");
            return capacity as i32;
        }

        let display = Resolution::new(fmt.display_area.width(), fmt.display_area.height());
        let output = if display.width > 0 && display.height > 0 {
            display
        } else {
            format.coded
        };
        let output_format = if fmt.bit_depth_luma_minus8 > 0 {
            CudaVideoSurfaceFormat::P016
        } else {
            CudaVideoSurfaceFormat::Nv12
        };
        let creation_flags = if codec.prefers_cuda_path() {
            create_flags::PREFER_CUDA
        } else {
            create_flags::DEFAULT
        };

        let mut create_info = CuvidDecodeCreateInfo {
            width: fmt.coded_width.into(),
            height: fmt.coded_height.into(),
            num_decode_surfaces: (capacity as u32).into(),
            codec_type: fmt.codec,
            chroma_format: fmt.chroma_format,
            creation_flags: creation_flags.into(),
            bit_depth_minus8: u32::from(fmt.bit_depth_luma_minus8).into(),
            max_width: fmt.coded_width.into(),
            max_height: fmt.coded_height.into(),
            display_area: ShortRect {
                left: fmt.display_area.left as i16,
                top: fmt.display_area.top as i16,
                right: fmt.display_area.right as i16,
                bottom: fmt.display_area.bottom as i16,
            },
            output_format,
            deinterlace_mode: if format.progressive {
                CudaVideoDeinterlaceMode::Weave
            } else {
                self.deinterlace
            },
            target_width: output.width.into(),
            target_height: output.height.into(),
            num_output_surfaces: OUTPUT_SURFACES.into(),
            ..CuvidDecodeCreateInfo::default()
        };

        // SAFETY: create_info is fully initialised; the handle is written to
        // state.decoder, which the decoder lock protects.
        let result = unsafe { (self.lib.cuvidCreateDecoder)(&mut state.decoder, &mut create_info) };
        if let Err(reason) = check_cuvid_result(result, "cuvidCreateDecoder") {
            state.decoder = ptr::null_mut();
            drop(state);
            return self.fail(DecodeError::HwDecoderInit { codec, reason });
        }
        state.output = output;

        info!(
            codec = codec.display_name(),
            coded = %format.coded,
            output = %output,
            surfaces = capacity,
            output_format = ?output_format,
            prefer_cuda = creation_flags == create_flags::PREFER_CUDA,
            "NVDEC decoder created"
        );
        capacity as i32
    }

    fn decode(&self, pic: &mut CuvidPicParams) -> i32 {
        let Ok(slot) = usize::try_from(pic.curr_pic_idx) else {
            return self.fail(DecodeError::DecodeFailed {
                frame: self.decoder.lock().pictures_decoded,
                reason: format!("negative picture index {}", pic.curr_pic_idx),
            });
        };
        let field = match (pic.field_pic_flag != 0, pic.second_field != 0) {
            (false, _) => FieldRole::Frame,
            (true, false) => FieldRole::FirstField,
            (true, true) => FieldRole::SecondField,
        };
        let params = PictureParams {
            slot,
            field,
            keyframe: pic.intra_pic_flag != 0,
        };

        // May block until the consumer frees the slot; no lock is held here.
        if !self.callbacks.on_picture_decode(&params).is_proceed() {
            debug!(slot, "Decode refused by synchronizer");
            return self.reject();
        }

        let mut state = self.decoder.lock();
        if state.decoder.is_null() {
            drop(state);
            self.callbacks.on_decode_failed(slot, "no decoder");
            return self.fail(DecodeError::NotConfigured);
        }
        // SAFETY: valid decoder handle; pic points at parser-owned params
        // that live for the duration of this callback.
        let result = unsafe { (self.lib.cuvidDecodePicture)(state.decoder, pic) };
        if let Err(reason) = check_cuvid_result(result, "cuvidDecodePicture") {
            let frame = state.pictures_decoded;
            drop(state);
            self.callbacks.on_decode_failed(slot, &reason);
            return self.fail(DecodeError::DecodeFailed { frame, reason });
        }
        state.pictures_decoded += 1;
        trace!(slot, field = ?field, "Picture submitted to NVDEC");
        1
    }

    fn display(&self, info: &CuvidParserDispInfo) -> i32 {
        let Ok(slot) = usize::try_from(info.picture_index) else {
            return self.fail(DecodeError::DecodeFailed {
                frame: 0,
                reason: format!("negative display index {}", info.picture_index),
            });
        };
        let timestamp = self
            .timestamps
            .load(Ordering::Acquire)
            .then_some(info.timestamp);
        let metadata = if info.progressive_frame != 0 {
            DisplayMetadata::progressive(timestamp)
        } else {
            DisplayMetadata::interlaced(
                timestamp,
                info.top_field_first != 0,
                info.repeat_first_field.max(0) as u32,
            )
        };

        match self.callbacks.on_picture_display(slot, metadata) {
            DecodeDecision::Proceed => 1,
            DecodeDecision::Reject => self.reject(),
        }
    }
}

// ---------------------------------------------------------------------------
// extern "C" trampolines
// ---------------------------------------------------------------------------

/// # Safety
///
/// `user_data` is the `CallbackContext` registered with the parser, which
/// outlives it. `format` is valid for the duration of the call.
unsafe extern "C" fn sequence_callback(user_data: *mut c_void, format: *mut CuVideoFormat) -> i32 {
    let ctx = &*(user_data as *const CallbackContext);
    match format.as_ref() {
        Some(format) => ctx.sequence(format),
        None => 0,
    }
}

/// # Safety
///
/// See [`sequence_callback`]. `pic_params` is valid for the call.
unsafe extern "C" fn decode_picture_callback(
    user_data: *mut c_void,
    pic_params: *mut CuvidPicParams,
) -> i32 {
    let ctx = &*(user_data as *const CallbackContext);
    match pic_params.as_mut() {
        Some(pic) => ctx.decode(pic),
        None => 0,
    }
}

/// # Safety
///
/// See [`sequence_callback`]. `disp_info` is null on the end-of-stream
/// notification.
unsafe extern "C" fn display_picture_callback(
    user_data: *mut c_void,
    disp_info: *mut CuvidParserDispInfo,
) -> i32 {
    let ctx = &*(user_data as *const CallbackContext);
    match disp_info.as_ref() {
        Some(info) => ctx.display(info),
        None => {
            debug!("Parser end-of-stream notification");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// NvDecEngine
// ---------------------------------------------------------------------------

struct Parser {
    handle: CUvideoparser,
    context: Box<CallbackContext>,
}

// SAFETY: the parser handle is only used under the parser lock.
unsafe impl Send for Parser {}

/// Hardware decode engine on NVDEC.
///
/// Created unconfigured; [`DecodeEngine::configure`] creates the parser for
/// the stream's codec. The decoder itself appears on the first accepted
/// sequence header.
pub struct NvDecEngine {
    lib: Arc<NvcuvidLibrary>,
    cuda: Arc<CudaContext>,
    gpu_name: String,
    max_display_delay: u32,
    clock_rate: u32,
    deinterlace: DeinterlaceMode,
    parser: Mutex<Option<Parser>>,
    decoder: Arc<Mutex<DecoderState>>,
}

impl NvDecEngine {
    /// Create a CUDA context on `device` and load `nvcuvid`.
    pub fn new(device: usize, config: &SessionConfig) -> Result<Self, DecodeError> {
        let cuda = CudaContext::new(device)
            .map_err(|e| DecodeError::Gpu(format!("CUDA context init failed: {e}")))?;
        let lib = NvcuvidLibrary::load().map_err(|e| DecodeError::Gpu(e.to_string()))?;
        Self::with_library(Arc::new(lib), cuda, config)
    }

    pub fn with_library(
        lib: Arc<NvcuvidLibrary>,
        cuda: Arc<CudaContext>,
        config: &SessionConfig,
    ) -> Result<Self, DecodeError> {
        cuda.bind_to_thread()
            .map_err(|e| DecodeError::Gpu(format!("CUDA bind_to_thread failed: {e}")))?;
        let gpu_name = cuda
            .name()
            .unwrap_or_else(|_| "Unknown NVIDIA GPU".to_string());
        info!(gpu = %gpu_name, "NVDEC engine ready");

        Ok(Self {
            lib,
            cuda,
            gpu_name,
            max_display_delay: config.max_display_delay,
            clock_rate: config.engine_clock_rate,
            deinterlace: config.deinterlace,
            parser: Mutex::new(None),
            decoder: Arc::new(Mutex::new(DecoderState::new())),
        })
    }

    pub fn gpu_name(&self) -> &str {
        &self.gpu_name
    }

    /// Output size of mapped surfaces, once the decoder exists.
    pub fn output_size(&self) -> Option<Resolution> {
        let state = self.decoder.lock();
        (!state.decoder.is_null()).then_some(state.output)
    }

    pub fn pictures_decoded(&self) -> u64 {
        self.decoder.lock().pictures_decoded
    }

    fn bind(&self) -> Result<(), DecodeError> {
        self.cuda
            .bind_to_thread()
            .map_err(|e| DecodeError::Gpu(format!("CUDA bind_to_thread failed: {e}")))
    }

    /// Push one packet through the parser and collect callback outcomes.
    fn parse(&self, mut packet: CuvidSourceDataPacket, call: &str) -> Result<FeedStatus, DecodeError> {
        self.bind()?;
        let guard = self.parser.lock();
        let parser = guard.as_ref().ok_or(DecodeError::NotConfigured)?;
        if parser.context.rejected.load(Ordering::Acquire) {
            return Ok(FeedStatus::Rejected);
        }
        if packet.flags as u32 & packet_flags::TIMESTAMP != 0 {
            parser.context.timestamps.store(true, Ordering::Release);
        }

        // SAFETY: valid parser handle; the payload outlives this call, which
        // processes it synchronously.
        let result = unsafe { (self.lib.cuvidParseVideoData)(parser.handle, &mut packet) };

        if parser.context.rejected.load(Ordering::Acquire) {
            return Ok(FeedStatus::Rejected);
        }
        if let Some(err) = parser.context.last_error.lock().take() {
            return Err(err);
        }
        check_cuvid_result(result, call).map_err(|reason| DecodeError::DecodeFailed {
            frame: self.pictures_decoded(),
            reason,
        })?;
        Ok(FeedStatus::Accepted)
    }
}

impl DecodeEngine for NvDecEngine {
    fn name(&self) -> &str {
        "nvdec"
    }

    fn configure(
        &self,
        info: &StreamInfo,
        max_surfaces: usize,
        callbacks: Arc<dyn DecodeCallbacks>,
    ) -> Result<(), DecodeError> {
        let codec = info.codec;
        let cuda_codec = CudaVideoCodec::from_common(codec).ok_or(DecodeError::UnsupportedCodec(codec))?;
        if max_surfaces == 0 {
            return Err(DecodeError::InsufficientSurfaces {
                required: 1,
                available: 0,
            });
        }

        let mut guard = self.parser.lock();
        if guard.is_some() {
            return Err(DecodeError::HwDecoderInit {
                codec,
                reason: "engine already configured".into(),
            });
        }

        let context = Box::new(CallbackContext {
            lib: self.lib.clone(),
            callbacks,
            decoder: self.decoder.clone(),
            capacity: max_surfaces,
            deinterlace: self.deinterlace.into(),
            rejected: AtomicBool::new(false),
            timestamps: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        let mut params = CuvidParserParams {
            codec_type: cuda_codec,
            max_num_decode_surfaces: max_surfaces as u32,
            clock_rate: self.clock_rate,
            max_display_delay: self.max_display_delay,
            user_data: &*context as *const CallbackContext as *mut c_void,
            pfn_sequence_callback: Some(sequence_callback),
            pfn_decode_picture: Some(decode_picture_callback),
            pfn_display_picture: Some(display_picture_callback),
            ..CuvidParserParams::default()
        };

        self.bind()?;
        let mut handle: CUvideoparser = ptr::null_mut();
        // SAFETY: params is initialised; user_data points into the Box that
        // is stored next to the handle and dropped after the parser.
        let result = unsafe { (self.lib.cuvidCreateVideoParser)(&mut handle, &mut params) };
        check_cuvid_result(result, "cuvidCreateVideoParser")
            .map_err(|reason| DecodeError::HwDecoderInit { codec, reason })?;

        info!(
            codec = codec.display_name(),
            surfaces = max_surfaces,
            delay = self.max_display_delay,
            clock_rate = self.clock_rate,
            "CUVID parser created"
        );
        *guard = Some(Parser { handle, context });
        Ok(())
    }

    fn feed(&self, packet: &Packet) -> Result<FeedStatus, DecodeError> {
        if packet.is_empty() {
            return Ok(FeedStatus::Accepted);
        }
        trace!(bytes = packet.data.len(), pts = ?packet.pts, "Feeding NVDEC parser");
        self.parse(
            CuvidSourceDataPacket::payload(&packet.data, packet.pts),
            "cuvidParseVideoData",
        )
    }

    fn flush(&self) -> Result<FeedStatus, DecodeError> {
        debug!("Flushing NVDEC parser");
        self.parse(
            CuvidSourceDataPacket::end_of_stream(),
            "cuvidParseVideoData (end of stream)",
        )
    }

    fn map_surface(&self, slot: usize, pass: FieldPass) -> Result<SurfaceView, DecodeError> {
        self.bind()?;
        let state = self.decoder.lock();
        if state.decoder.is_null() {
            return Err(DecodeError::NotConfigured);
        }

        let mut proc_params = proc_params(pass);
        let mut device_ptr = 0u64;
        let mut pitch = 0u32;

        // SAFETY: valid decoder handle; slot is a decode surface index the
        // synchronizer holds as mapped; the out-params are local.
        let result = unsafe {
            (self.lib.cuvidMapVideoFrame64)(
                state.decoder,
                slot as i32,
                &mut device_ptr,
                &mut pitch,
                &mut proc_params,
            )
        };
        check_cuvid_result(result, "cuvidMapVideoFrame64")
            .map_err(|reason| DecodeError::MapFailed { slot, reason })?;

        let view = SurfaceView {
            slot,
            device_ptr,
            pitch,
            width: state.output.width,
            height: state.output.height,
            progressive: pass.progressive,
            field_index: pass.index,
        };
        debug!(?view, pass = pass.index, of = pass.count, "Mapped surface");
        Ok(view)
    }

    fn unmap_surface(&self, view: &SurfaceView) -> Result<(), DecodeError> {
        self.bind()?;
        let state = self.decoder.lock();
        if state.decoder.is_null() {
            return Err(DecodeError::InvalidSession);
        }
        // SAFETY: device_ptr came from cuvidMapVideoFrame64 on this decoder.
        let result = unsafe { (self.lib.cuvidUnmapVideoFrame64)(state.decoder, view.device_ptr) };
        check_cuvid_result(result, "cuvidUnmapVideoFrame64").map_err(|reason| {
            DecodeError::MapFailed {
                slot: view.slot,
                reason,
            }
        })
    }
}

impl std::fmt::Debug for NvDecEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.decoder.lock();
        f.debug_struct("NvDecEngine")
            .field("gpu", &self.gpu_name)
            .field("decoder_active", &!state.decoder.is_null())
            .field("output", &state.output)
            .field("pictures_decoded", &state.pictures_decoded)
            .finish()
    }
}

impl Drop for NvDecEngine {
    fn drop(&mut self) {
        if let Err(e) = self.bind() {
            warn!("{e}; releasing NVDEC objects without a bound context");
        }

        // Parser first: destroying it may still run callbacks that use the
        // decoder.
        if let Some(parser) = self.parser.get_mut().take() {
            // SAFETY: valid handle; the callback context is dropped after.
            let result = unsafe { (self.lib.cuvidDestroyVideoParser)(parser.handle) };
            if result != CUDA_SUCCESS {
                error!(error_code = result, "Failed to destroy CUVID parser");
            }
            drop(parser.context);
        }

        let mut state = self.decoder.lock();
        state.destroy(&self.lib);
        info!(
            gpu = %self.gpu_name,
            pictures_decoded = state.pictures_decoded,
            "NVDEC engine destroyed"
        );
    }
}

/// Post-processing parameters for one presentation pass.
fn proc_params(pass: FieldPass) -> CuvidProcParams {
    CuvidProcParams {
        progressive_frame: i32::from(pass.progressive),
        second_field: pass.index as i32,
        top_field_first: i32::from(pass.top_field_first),
        unpaired_field: i32::from(pass.unpaired()),
        ..CuvidProcParams::default()
    }
}

/// Codecs this engine can be configured for.
pub fn supports(codec: VideoCodec) -> bool {
    CudaVideoCodec::from_common(codec).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_state_starts_empty() {
        let state = DecoderState::new();
        assert!(state.decoder.is_null());
        assert_eq!(state.output, Resolution::new(0, 0));
        assert_eq!(state.pictures_decoded, 0);
    }

    #[test]
    fn all_pipeline_codecs_are_supported() {
        assert!(supports(VideoCodec::H264));
        assert!(supports(VideoCodec::H265));
        assert!(supports(VideoCodec::Mpeg2));
        assert!(supports(VideoCodec::Jpeg));
    }

    #[test]
    fn progressive_pass_is_unpaired() {
        let params = proc_params(FieldPass::FRAME);
        assert_eq!(params.progressive_frame, 1);
        assert_eq!(params.second_field, 0);
        assert_eq!(params.unpaired_field, 1);
    }

    #[test]
    fn pulldown_passes_advance_field_selector() {
        let passes: Vec<_> = (0..3)
            .map(|index| {
                proc_params(FieldPass {
                    index,
                    count: 3,
                    progressive: false,
                    top_field_first: true,
                })
            })
            .collect();
        let selectors: Vec<i32> = passes.iter().map(|p| p.second_field).collect();
        assert_eq!(selectors, [0, 1, 2]);
        assert!(passes.iter().all(|p| p.unpaired_field == 0 && p.top_field_first == 1));
    }
}
