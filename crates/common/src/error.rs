//! Central error types for the pipeline (thiserror-based).

use thiserror::Error;

use crate::codec::VideoCodec;
use crate::packet::SequenceFormat;

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Demux error: {0}")]
    Demux(#[from] DemuxError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller bugs in the slot protocol. Never recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("slot index {index} out of range (pool capacity {capacity})")]
    SlotOutOfRange { index: usize, capacity: usize },

    #[error("slot {0} released twice")]
    DoubleRelease(usize),

    #[error("slot {index}: invalid transition {from} -> {to}")]
    InvalidTransition {
        index: usize,
        from: &'static str,
        to: &'static str,
    },
}

/// Frame-synchronization errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),

    #[error("format change rejected: expected {expected:?}, got {got:?}")]
    FormatMismatch {
        expected: Box<SequenceFormat>,
        got: Box<SequenceFormat>,
    },

    #[error("synchronizer is closed")]
    Closed,
}

impl SyncError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }
}

/// Demuxer/container parsing errors.
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("Unsupported container format: {0}")]
    UnsupportedContainer(String),

    #[error("Invalid structure at offset {offset}: {reason}")]
    InvalidStructure { offset: u64, reason: String },

    #[error("No video track found")]
    NoVideoTrack,

    #[error("Unsupported video codec: {0:?}")]
    UnsupportedVideoCodec(VideoCodec),

    #[error("{0:?} stream dimensions must be supplied explicitly")]
    MissingDimensions(VideoCodec),

    #[error("Truncated data: expected {expected} bytes, got {got}")]
    TruncatedData { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode engine errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("HW decoder init failed for {codec:?}: {reason}")]
    HwDecoderInit { codec: VideoCodec, reason: String },

    #[error("Decode failed at frame {frame}: {reason}")]
    DecodeFailed { frame: u64, reason: String },

    #[error("Unsupported codec for HW decode: {0:?}")]
    UnsupportedCodec(VideoCodec),

    #[error("Stream needs {required} decode surfaces, pool has {available}")]
    InsufficientSurfaces { required: u32, available: usize },

    #[error("Map of slot {slot} failed: {reason}")]
    MapFailed { slot: usize, reason: String },

    #[error("Decoder not configured")]
    NotConfigured,

    #[error("Decoder session expired or invalid")]
    InvalidSession,

    #[error("GPU error: {0}")]
    Gpu(String),
}

/// Convenience Result type for pipeline operations.
pub type EngineResult<T> = Result<T, EngineError>;
