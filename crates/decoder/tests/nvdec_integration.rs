//! NVDEC tests. They need an NVIDIA GPU and driver and are ignored by
//! default: `cargo test -p vs-decoder -- --ignored`.
//!
//! `decodes_annexb_file` additionally reads `VIDSYNC_TEST_H264`, a raw
//! Annex-B H.264 stream of 1920x1080 (coded 1920x1088) progressive video.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vs_common::{
    ChromaFormat, DecodeCallbacks, DecodeDecision, DecodeEngine, DecodeError, DisplayMetadata,
    FeedStatus, FieldOrder, FieldPass, Packet, PictureParams, Rational, Resolution,
    SequenceFormat, SessionConfig, StreamInfo, SyncError, VideoCodec,
};
use vs_decoder::{NvDecEngine, NvcuvidLibrary};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

fn h264_info() -> StreamInfo {
    StreamInfo {
        codec: VideoCodec::H264,
        coded: Resolution::new(1920, 1088),
        display: Resolution::HD,
        chroma_format: ChromaFormat::Yuv420,
        bit_depth: 8,
        field_order: FieldOrder::Progressive,
        time_base: Rational::new(0, 1),
        frame_rate: None,
        video_stream_index: 0,
        extra_data: Vec::new(),
    }
}

/// Accepts everything and remembers displayed slots. Surfaces are
/// recycled immediately, which is fine without a consumer.
#[derive(Default)]
struct Sink {
    formats: Mutex<Vec<SequenceFormat>>,
    decoded: AtomicU64,
    displayed: Mutex<Vec<usize>>,
}

impl DecodeCallbacks for Sink {
    fn on_sequence_format(&self, format: &SequenceFormat) -> Result<usize, SyncError> {
        self.formats.lock().push(*format);
        Ok(8)
    }

    fn on_picture_decode(&self, _picture: &PictureParams) -> DecodeDecision {
        self.decoded.fetch_add(1, Ordering::Relaxed);
        DecodeDecision::Proceed
    }

    fn on_picture_display(&self, slot: usize, _metadata: DisplayMetadata) -> DecodeDecision {
        self.displayed.lock().push(slot);
        DecodeDecision::Proceed
    }

    fn on_decode_failed(&self, _slot: usize, _reason: &str) {}
}

#[test]
#[ignore = "requires an NVIDIA driver"]
fn library_loads() {
    init_logging();
    let lib = NvcuvidLibrary::load().expect("nvcuvid should load");
    assert!(format!("{lib:?}").contains("NvcuvidLibrary"));
}

#[test]
#[ignore = "requires an NVIDIA GPU"]
fn unconfigured_engine_refuses_work() {
    init_logging();
    let engine = NvDecEngine::new(0, &SessionConfig::default()).unwrap();
    let packet = Packet::new(vec![0, 0, 0, 1, 0x65], None, true);
    assert!(matches!(engine.feed(&packet), Err(DecodeError::NotConfigured)));
    assert!(matches!(
        engine.map_surface(0, FieldPass::FRAME),
        Err(DecodeError::NotConfigured)
    ));
}

#[test]
#[ignore = "requires an NVIDIA GPU"]
fn configure_twice_fails() {
    init_logging();
    let engine = NvDecEngine::new(0, &SessionConfig::default()).unwrap();
    let sink = Arc::new(Sink::default());
    engine.configure(&h264_info(), 8, sink.clone()).unwrap();
    assert!(engine.configure(&h264_info(), 8, sink).is_err());
    assert_eq!(engine.flush().unwrap(), FeedStatus::Accepted);
}

#[test]
#[ignore = "requires an NVIDIA GPU and VIDSYNC_TEST_H264"]
fn decodes_annexb_file() {
    init_logging();
    let Ok(path) = std::env::var("VIDSYNC_TEST_H264") else {
        eprintln!("VIDSYNC_TEST_H264 not set, skipping");
        return;
    };
    let data = std::fs::read(path).unwrap();

    let engine = NvDecEngine::new(0, &SessionConfig::default()).unwrap();
    let sink = Arc::new(Sink::default());
    engine.configure(&h264_info(), 8, sink.clone()).unwrap();

    for (i, chunk) in data.chunks(64 * 1024).enumerate() {
        let packet = Packet::new(chunk.to_vec(), None, i == 0);
        assert_eq!(engine.feed(&packet).unwrap(), FeedStatus::Accepted);
    }
    engine.flush().unwrap();

    let formats = sink.formats.lock();
    assert_eq!(formats[0].coded, Resolution::new(1920, 1088));
    let displayed = sink.displayed.lock().clone();
    assert!(!displayed.is_empty());
    assert_eq!(displayed.len() as u64, sink.decoded.load(Ordering::Relaxed));

    let last = *displayed.last().unwrap();
    let view = engine.map_surface(last, FieldPass::FRAME).unwrap();
    assert_ne!(view.device_ptr, 0);
    assert!(view.pitch >= 1920);
    assert_eq!((view.width, view.height), (1920, 1080));
    engine.unmap_surface(&view).unwrap();
}
