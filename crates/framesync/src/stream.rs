//! Per-session stream state: the end-of-stream latch and counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Synchronizer lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Decoding in progress.
    Active,
    /// Decode finished; queued or mapped pictures still outstanding.
    Draining,
    /// Decode finished, queue empty, no picture pending display.
    Closed,
}

/// Set-once latches and monotonic counters shared by producer and consumer.
#[derive(Debug, Default)]
pub struct StreamState {
    finished: AtomicBool,
    halted: AtomicBool,
    decoded: AtomicU64,
    displayed: AtomicU64,
    released: AtomicU64,
    rejected: AtomicU64,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch decode-finished. Returns `true` only for the call that set it.
    pub fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Latch the format-rejected state. Returns `true` the first time.
    pub fn halt(&self) -> bool {
        !self.halted.swap(true, Ordering::AcqRel)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn record_decoded(&self) -> u64 {
        self.decoded.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_displayed(&self) -> u64 {
        self.displayed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn displayed(&self) -> u64 {
        self.displayed.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
