//! Collaborator traits: demuxer, bitstream filter, decode engine and the
//! callbacks the engine drives.
//!
//! The synchronizer programs against these traits, never against the
//! concrete NVDEC or synthetic engines.

use std::sync::Arc;

use crate::error::{DecodeError, DemuxError, SyncError};
use crate::packet::{DisplayMetadata, Packet, PictureParams, SequenceFormat, StreamInfo};
use crate::surface::{FieldPass, SurfaceView};

/// Source of compressed packets.
pub trait Demuxer: Send {
    /// Stream information probed when the source was opened.
    fn stream_info(&self) -> &StreamInfo;

    /// Read the next packet. `Ok(None)` is end of input.
    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError>;
}

/// Rewrites packet framing (e.g. AVCC length prefixes to Annex-B start codes).
pub trait BitstreamFilter: Send {
    fn filter(&mut self, packet: Packet) -> Result<Packet, DemuxError>;
}

/// Result of handing a packet to the decode engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    Accepted,
    /// The engine (or the synchronizer behind it) refuses further input.
    Rejected,
}

/// Answer from a decode or display callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeDecision {
    Proceed,
    /// Abort: the session is being torn down or the stream was rejected.
    Reject,
}

impl DecodeDecision {
    pub fn is_proceed(self) -> bool {
        self == Self::Proceed
    }
}

/// Producer-side callbacks invoked by a decode engine.
///
/// Engines serialize calls per kind but may invoke them from any thread.
/// `on_picture_decode` may block until the requested slot is free.
pub trait DecodeCallbacks: Send + Sync {
    /// Sequence header seen. Returns the number of surfaces available to
    /// the engine, or an error if the format is rejected.
    fn on_sequence_format(&self, format: &SequenceFormat) -> Result<usize, SyncError>;

    /// The engine is about to decode into `picture.slot`.
    fn on_picture_decode(&self, picture: &PictureParams) -> DecodeDecision;

    /// The picture in `slot` is ready for display, in display order.
    fn on_picture_display(&self, slot: usize, metadata: DisplayMetadata) -> DecodeDecision;

    /// Decoding into `slot` failed after it was acquired.
    fn on_decode_failed(&self, slot: usize, reason: &str);
}

/// Hardware (or synthetic) decode engine.
pub trait DecodeEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Prepare for `info` with at most `max_surfaces` decode surfaces and
    /// register the callbacks.
    fn configure(
        &self,
        info: &StreamInfo,
        max_surfaces: usize,
        callbacks: Arc<dyn DecodeCallbacks>,
    ) -> Result<(), DecodeError>;

    /// Parse one packet. Callbacks fire from inside this call.
    fn feed(&self, packet: &Packet) -> Result<FeedStatus, DecodeError>;

    /// Signal end of stream so pending display callbacks fire.
    fn flush(&self) -> Result<FeedStatus, DecodeError>;

    /// Map one presentation pass of a decoded surface for reading.
    fn map_surface(&self, slot: usize, pass: FieldPass) -> Result<SurfaceView, DecodeError>;

    fn unmap_surface(&self, view: &SurfaceView) -> Result<(), DecodeError>;
}
