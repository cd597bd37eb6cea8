//! `vs-common` — Shared types, traits, and errors for the vidsync decode pipeline.
//!
//! - **Types**: `Rational`, `Resolution`
//! - **Codec**: `VideoCodec`, `ChromaFormat`, `FieldOrder`
//! - **Packets**: `Packet`, `StreamInfo`, and the decode callback payloads
//! - **Traits**: `Demuxer`, `BitstreamFilter`, `DecodeEngine`, `DecodeCallbacks`
//! - **Surfaces**: `FieldPass`, `SurfaceView`, `MappedSurface` (RAII unmap)
//! - **Errors**: `SyncError`, `DemuxError`, `DecodeError`, `EngineError`
//! - **Config**: `SessionConfig`

pub mod codec;
pub mod config;
pub mod error;
pub mod packet;
pub mod surface;
pub mod traits;
pub mod types;

pub use codec::{ChromaFormat, FieldOrder, VideoCodec};
pub use config::{DeinterlaceMode, SessionConfig, MAX_SURFACES};
pub use error::{
    ContractViolation, DecodeError, DemuxError, EngineError, EngineResult, SyncError,
};
pub use packet::{DisplayMetadata, FieldRole, Packet, PictureParams, SequenceFormat, StreamInfo};
pub use surface::{FieldPass, MappedSurface, SurfaceView};
pub use traits::{
    BitstreamFilter, DecodeCallbacks, DecodeDecision, DecodeEngine, Demuxer, FeedStatus,
};
pub use types::{Rational, Resolution};
