//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::types::Rational;

/// Upper bound on decode surfaces (NVDEC allows at most 32).
pub const MAX_SURFACES: usize = 32;

/// How interlaced pictures are post-processed when mapped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeinterlaceMode {
    /// Fields are delivered woven into one frame.
    Weave,
    /// Each field is line-doubled.
    Bob,
    /// Motion adaptive (hardware default).
    #[default]
    Adaptive,
}

/// Frame-synchronization session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of decode surfaces in the pool.
    pub num_surfaces: usize,
    /// Pictures the parser may hold back before display (reorder depth).
    pub max_display_delay: u32,
    /// Tick rate of the decode engine clock, in Hz.
    pub engine_clock_rate: u32,
    /// Read size for raw elementary streams.
    pub read_chunk_size: usize,
    pub deinterlace: DeinterlaceMode,
    /// Sleep between polls when a consumer loop sees `WouldBlock`.
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_surfaces: 8,
            max_display_delay: 1,
            engine_clock_rate: 10_000_000,
            read_chunk_size: 1 << 20,
            deinterlace: DeinterlaceMode::Adaptive,
            poll_interval_ms: 2,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Pool capacity, clamped to `1..=MAX_SURFACES`.
    pub fn surfaces(&self) -> usize {
        self.num_surfaces.clamp(1, MAX_SURFACES)
    }

    /// Time base of the decode engine clock.
    pub fn engine_time_base(&self) -> Rational {
        Rational::from_clock_rate(self.engine_clock_rate)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
