//! Display Queue — FIFO of pictures ready for presentation.
//!
//! The decode engine reorders decode-order completions internally and
//! fires its display callback in presentation order, so the queue only has
//! to preserve push order. It is unbounded in entry count: the bounded
//! resource is the surface pool, which throttles pushes because a slot
//! cannot produce a new entry until the consumer releases it.
//!
//! Closing the queue is one-way. A closed queue rejects pushes but keeps
//! serving what it already holds; once empty it reports
//! [`QueuePop::Drained`] so a polling consumer can tell "wait" from "done".

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vs_common::{DisplayMetadata, FieldPass};

use crate::fields::{field_passes, presentation_passes};

/// One decoded picture waiting for the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DisplayEntry {
    pub slot: usize,
    /// Presentation time in the engine clock, if known.
    pub timestamp: Option<i64>,
    pub progressive: bool,
    pub top_field_first: bool,
    pub repeat_first_field: u32,
}

impl DisplayEntry {
    pub fn new(slot: usize, metadata: DisplayMetadata) -> Self {
        Self {
            slot,
            timestamp: metadata.timestamp,
            progressive: metadata.progressive,
            top_field_first: metadata.top_field_first,
            repeat_first_field: metadata.repeat_first_field,
        }
    }

    /// Number of presentation passes this entry needs.
    pub fn passes(&self) -> u32 {
        presentation_passes(self.progressive, self.repeat_first_field)
    }

    pub fn field_passes(&self) -> impl Iterator<Item = FieldPass> {
        field_passes(self.progressive, self.top_field_first, self.repeat_first_field)
    }
}

/// Outcome of a non-blocking (or timed) pop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueuePop {
    Entry(DisplayEntry),
    /// Nothing queued yet; more may arrive.
    Empty,
    /// Closed and empty; nothing will ever arrive.
    Drained,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<DisplayEntry>,
    closed: bool,
}

/// Thread-safe FIFO of [`DisplayEntry`] values.
#[derive(Default)]
pub struct DisplayQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl DisplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Never blocks.
    ///
    /// Returns the entry back if the queue is closed.
    pub fn push(&self, entry: DisplayEntry) -> Result<(), DisplayEntry> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(entry);
        }
        state.entries.push_back(entry);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Non-blocking pop that distinguishes "empty for now" from "drained".
    pub fn try_pop(&self) -> QueuePop {
        let mut state = self.state.lock();
        Self::take(&mut state)
    }

    /// Wait up to `timeout` for an entry. Returns early with
    /// [`QueuePop::Drained`] if the queue is closed while waiting.
    pub fn pop_timeout(&self, timeout: Duration) -> QueuePop {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match Self::take(&mut state) {
                QueuePop::Empty => {}
                other => return other,
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Self::take(&mut state);
            }
        }
    }

    /// Stop accepting entries and wake every waiting consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<DisplayEntry> {
        self.state.lock().entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn take(state: &mut QueueState) -> QueuePop {
        match state.entries.pop_front() {
            Some(entry) => QueuePop::Entry(entry),
            None if state.closed => QueuePop::Drained,
            None => QueuePop::Empty,
        }
    }
}

impl std::fmt::Debug for DisplayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DisplayQueue")
            .field("queued", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
