//! Shared fixtures for the framesync integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use parking_lot::Mutex;
use vs_common::{
    BitstreamFilter, ChromaFormat, DecodeCallbacks, DecodeEngine, DecodeError, DemuxError,
    Demuxer, FeedStatus, FieldOrder, FieldPass, Packet, Rational, Resolution, SessionConfig,
    StreamInfo, SurfaceView, VideoCodec,
};
use vs_decoder::{SyntheticConfig, SyntheticEngine, SyntheticScan};
use vs_framesync::{Pull, Session};

/// Generous bound for anything that should finish promptly. A deadlock
/// fails the test instead of hanging it.
pub const DEADLINE: Duration = Duration::from_secs(10);

pub fn stream_info(field_order: FieldOrder) -> StreamInfo {
    StreamInfo {
        codec: VideoCodec::H264,
        coded: Resolution::new(1920, 1088),
        display: Resolution::HD,
        chroma_format: ChromaFormat::Yuv420,
        bit_depth: 8,
        field_order,
        time_base: Rational::new(1, 1000),
        frame_rate: Some(Rational::FPS_30),
        video_stream_index: 0,
        extra_data: Vec::new(),
    }
}

/// Video packet with pts in milliseconds.
pub fn packet(pts: i64) -> Packet {
    Packet::new(vec![0, 0, 0, 1, 0x65, pts as u8], Some(pts), pts == 0)
}

/// Demuxer over a scripted list of read results.
pub struct ScriptedDemuxer {
    info: StreamInfo,
    script: VecDeque<Result<Packet, DemuxError>>,
}

impl ScriptedDemuxer {
    pub fn new(info: StreamInfo, script: Vec<Result<Packet, DemuxError>>) -> Self {
        Self {
            info,
            script: script.into(),
        }
    }

    /// `count` video packets with pts 0, 33, 66, ... (30 fps in ms).
    pub fn frames(info: StreamInfo, count: i64) -> Self {
        Self::new(info, (0..count).map(|i| Ok(packet(i * 33))).collect())
    }
}

impl Demuxer for ScriptedDemuxer {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        self.script.pop_front().transpose()
    }
}

/// Engine that records what it is fed and never calls back.
#[derive(Default)]
pub struct RecordingEngine {
    pub fed: Mutex<Vec<Packet>>,
    pub flushed: Mutex<bool>,
    /// Fail the feed with this 0-based index.
    pub fail_at: Option<usize>,
}

impl DecodeEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn configure(
        &self,
        _info: &StreamInfo,
        _max_surfaces: usize,
        _callbacks: Arc<dyn DecodeCallbacks>,
    ) -> Result<(), DecodeError> {
        Ok(())
    }

    fn feed(&self, packet: &Packet) -> Result<FeedStatus, DecodeError> {
        let mut fed = self.fed.lock();
        if self.fail_at == Some(fed.len()) {
            return Err(DecodeError::DecodeFailed {
                frame: fed.len() as u64,
                reason: "scripted failure".into(),
            });
        }
        fed.push(packet.clone());
        Ok(FeedStatus::Accepted)
    }

    fn flush(&self) -> Result<FeedStatus, DecodeError> {
        *self.flushed.lock() = true;
        Ok(FeedStatus::Accepted)
    }

    fn map_surface(&self, slot: usize, _pass: FieldPass) -> Result<SurfaceView, DecodeError> {
        Err(DecodeError::MapFailed {
            slot,
            reason: "recording engine has no surfaces".into(),
        })
    }

    fn unmap_surface(&self, _view: &SurfaceView) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Prefixes every packet with a marker byte; fails on packets whose pts
/// is in `reject`.
pub struct MarkingFilter {
    pub reject: Vec<i64>,
}

impl BitstreamFilter for MarkingFilter {
    fn filter(&mut self, mut packet: Packet) -> Result<Packet, DemuxError> {
        if packet.pts.is_some_and(|pts| self.reject.contains(&pts)) {
            return Err(DemuxError::InvalidStructure {
                offset: 0,
                reason: "scripted filter failure".into(),
            });
        }
        packet.data.insert(0, 0xAB);
        Ok(packet)
    }
}

pub fn config(surfaces: usize, display_delay: u32) -> SessionConfig {
    SessionConfig {
        num_surfaces: surfaces,
        max_display_delay: display_delay,
        ..SessionConfig::default()
    }
}

pub fn synthetic(display_delay: u32, scan: SyntheticScan) -> Arc<SyntheticEngine> {
    Arc::new(SyntheticEngine::new(SyntheticConfig {
        display_delay: display_delay as usize,
        scan,
        ..SyntheticConfig::default()
    }))
}

/// Pull every entry until end of stream, releasing each one through its
/// lease. Returns the pulled timestamps.
pub fn consume_all(session: &Session) -> Vec<Option<i64>> {
    let mut seen = Vec::new();
    loop {
        match session.pull_lease_timeout(Duration::from_millis(20)).unwrap() {
            Pull::Frame(lease) => seen.push(lease.timestamp()),
            Pull::WouldBlock => continue,
            Pull::EndOfStream => return seen,
        }
    }
}

/// Run `f` on its own thread and fail if it does not finish in time.
pub fn within_deadline<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = channel::bounded(1);
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(DEADLINE)
        .expect("operation did not finish before the deadline")
}
