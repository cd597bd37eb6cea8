//! NVIDIA NVDEC hardware decoding through the CUVID parser.
//!
//! `nvcuvid` is loaded at runtime; [`NvDecEngine::new`] fails cleanly on
//! machines without an NVIDIA driver so callers can fall back to the
//! synthetic engine.

pub mod engine;
pub mod ffi;

pub use engine::{supports, NvDecEngine};
pub use ffi::{NvcuvidLibrary, NvcuvidLoadError};
