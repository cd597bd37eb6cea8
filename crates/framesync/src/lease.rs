//! Scoped ownership of a pulled display entry.

use std::fmt;

use tracing::error;
use vs_common::{FieldPass, SyncError};

use crate::queue::DisplayEntry;
use crate::synchronizer::FrameSynchronizer;

/// A pulled entry whose slot is released when the lease drops, on every
/// exit path of the consumer loop.
pub struct FrameLease<'a> {
    sync: &'a FrameSynchronizer,
    entry: DisplayEntry,
    released: bool,
}

impl<'a> FrameLease<'a> {
    pub(crate) fn new(sync: &'a FrameSynchronizer, entry: DisplayEntry) -> Self {
        Self {
            sync,
            entry,
            released: false,
        }
    }

    pub fn entry(&self) -> &DisplayEntry {
        &self.entry
    }

    pub fn slot(&self) -> usize {
        self.entry.slot
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.entry.timestamp
    }

    pub fn passes(&self) -> u32 {
        self.entry.passes()
    }

    pub fn field_passes(&self) -> impl Iterator<Item = FieldPass> {
        self.entry.field_passes()
    }

    /// Release now and observe the result.
    pub fn release(mut self) -> Result<(), SyncError> {
        self.released = true;
        self.sync.consumer_release(self.entry.slot)
    }
}

impl fmt::Debug for FrameLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("entry", &self.entry)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.sync.consumer_release(self.entry.slot) {
            error!(slot = self.entry.slot, "Failed to release leased slot: {e}");
        }
    }
}
