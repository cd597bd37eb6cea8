//! Source Driver — the demux loop.
//!
//! Runs on its own thread: reads packets, skips non-video streams, applies
//! the optional bitstream filter, rescales timestamps into the engine
//! clock and feeds the engine. Engine callbacks (and therefore blocking
//! surface acquires) run inside `feed`, on this thread.
//!
//! Every exit path ends the stream in the synchronizer so the consumer
//! observes termination.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use vs_common::{BitstreamFilter, DecodeEngine, Demuxer, FeedStatus, Rational};

use crate::synchronizer::FrameSynchronizer;

/// Why the driver loop ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DriverOutcome {
    /// Demuxer reached end of input and the engine was flushed.
    EndOfInput,
    /// The stop flag was raised.
    Stopped,
    /// The engine refused a packet (teardown or rejected format).
    Rejected,
    DemuxFailed(String),
    EngineFailed(String),
}

/// Summary of one driver run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriverReport {
    pub packets_read: u64,
    pub packets_fed: u64,
    /// Packets from non-video streams.
    pub packets_skipped: u64,
    /// Packets dropped because the bitstream filter failed on them.
    pub filter_errors: u64,
    pub bytes_fed: u64,
    pub outcome: DriverOutcome,
}

impl DriverReport {
    fn new() -> Self {
        Self {
            packets_read: 0,
            packets_fed: 0,
            packets_skipped: 0,
            filter_errors: 0,
            bytes_fed: 0,
            outcome: DriverOutcome::EndOfInput,
        }
    }
}

/// Owns the demuxer and feeds the engine until input ends or it is told
/// to stop.
pub struct SourceDriver {
    demuxer: Box<dyn Demuxer>,
    filter: Option<Box<dyn BitstreamFilter>>,
    engine: Arc<dyn DecodeEngine>,
    sync: Arc<FrameSynchronizer>,
    stop: Arc<AtomicBool>,
    engine_time_base: Rational,
}

impl SourceDriver {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        filter: Option<Box<dyn BitstreamFilter>>,
        engine: Arc<dyn DecodeEngine>,
        sync: Arc<FrameSynchronizer>,
        engine_time_base: Rational,
    ) -> Self {
        Self {
            demuxer,
            filter,
            engine,
            sync,
            stop: Arc::new(AtomicBool::new(false)),
            engine_time_base,
        }
    }

    /// Cooperative stop flag, checked between packets.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the loop on a named thread.
    pub fn spawn(self) -> io::Result<JoinHandle<DriverReport>> {
        thread::Builder::new()
            .name("vidsync-source".to_string())
            .spawn(move || self.run())
    }

    /// Run the loop on the calling thread.
    pub fn run(mut self) -> DriverReport {
        let info = self.demuxer.stream_info().clone();
        let video_stream = info.video_stream_index;
        let source_time_base = info.time_base;
        info!(
            engine = self.engine.name(),
            codec = info.codec.display_name(),
            coded = %info.coded,
            time_base = %source_time_base,
            "Source driver started"
        );

        let mut report = DriverReport::new();
        report.outcome = loop {
            if self.stop.load(Ordering::Acquire) {
                break DriverOutcome::Stopped;
            }

            let packet = match self.demuxer.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break self.flush(),
                Err(e) => {
                    error!("Demux read failed: {e}");
                    break DriverOutcome::DemuxFailed(e.to_string());
                }
            };
            report.packets_read += 1;

            if packet.stream_index != video_stream {
                report.packets_skipped += 1;
                continue;
            }

            let mut packet = match self.filter.as_mut() {
                Some(filter) => match filter.filter(packet) {
                    Ok(filtered) => filtered,
                    Err(e) => {
                        warn!(packet = report.packets_read, "Bitstream filter failed: {e}");
                        report.filter_errors += 1;
                        continue;
                    }
                },
                None => packet,
            };
            packet.pts = packet
                .pts
                .map(|pts| rescale_pts(pts, source_time_base, self.engine_time_base));

            trace!(size = packet.data.len(), pts = packet.pts, "Feeding packet");
            match self.engine.feed(&packet) {
                Ok(FeedStatus::Accepted) => {
                    report.packets_fed += 1;
                    report.bytes_fed += packet.data.len() as u64;
                }
                Ok(FeedStatus::Rejected) => {
                    debug!("Engine rejected packet, stopping");
                    break DriverOutcome::Rejected;
                }
                Err(e) => {
                    error!("Engine feed failed: {e}");
                    break DriverOutcome::EngineFailed(e.to_string());
                }
            }
        };

        self.sync.end_of_stream();
        info!(
            packets = report.packets_fed,
            bytes = report.bytes_fed,
            outcome = ?report.outcome,
            "Source driver finished"
        );
        report
    }

    /// End of input: push an end-of-stream packet so pending display
    /// callbacks fire before the stream is closed.
    fn flush(&self) -> DriverOutcome {
        match self.engine.flush() {
            Ok(FeedStatus::Accepted) => DriverOutcome::EndOfInput,
            Ok(FeedStatus::Rejected) => DriverOutcome::Rejected,
            Err(e) => {
                error!("Engine flush failed: {e}");
                DriverOutcome::EngineFailed(e.to_string())
            }
        }
    }
}

impl fmt::Debug for SourceDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDriver")
            .field("engine", &self.engine.name())
            .field("filter", &self.filter.is_some())
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}

/// Rescale a stream timestamp into the engine clock. Unknown time bases
/// pass the value through.
pub fn rescale_pts(pts: i64, from: Rational, to: Rational) -> i64 {
    if from.is_valid() && to.is_valid() {
        from.rescale(pts, to)
    } else {
        pts
    }
}
