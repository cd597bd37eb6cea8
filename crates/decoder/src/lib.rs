//! `vs-decoder` — Decode engines behind the `DecodeEngine` trait.
//!
//! - [`NvDecEngine`]: NVDEC via the CUVID parser, surfaces mapped per field
//! - [`SyntheticEngine`]: deterministic CPU stand-in with the same callback
//!   behaviour (reorder window, field pairs, pulldown), for tests and
//!   GPU-less runs

pub mod nvdec;
pub mod synthetic;

pub use nvdec::{NvDecEngine, NvcuvidLibrary, NvcuvidLoadError};
pub use synthetic::{SyntheticConfig, SyntheticEngine, SyntheticScan, SyntheticStats};
