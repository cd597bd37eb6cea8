//! Surface Pool — fixed set of decode-target slots.
//!
//! The decode engine picks slot indices itself (it is configured with the
//! pool's exact capacity) and asks the pool for a specific slot before it
//! decodes into it. If that slot is still queued for display or held by
//! the consumer, the engine's callback thread blocks until the consumer
//! releases it. That wait is the pipeline's backpressure: a slow consumer
//! starves the decoder instead of growing memory.
//!
//! Slot lifecycle:
//!
//! ```text
//! Free ──acquire──▶ Decoding ──mark_ready──▶ ReadyForDisplay
//!  ▲                                              │
//!  └────────release──── MappedForConsumption ◀──mark_mapped
//! ```
//!
//! All transitions happen under one mutex. Each slot has its own condition
//! variable so a release wakes only the waiter for that index; closing the
//! pool wakes everyone.

use std::fmt;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};
use vs_common::{ContractViolation, DisplayMetadata, FieldRole, SyncError};

use crate::queue::DisplayEntry;

/// Lifecycle state of one slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Free,
    Decoding,
    ReadyForDisplay,
    MappedForConsumption,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Decoding => "Decoding",
            Self::ReadyForDisplay => "ReadyForDisplay",
            Self::MappedForConsumption => "MappedForConsumption",
        }
    }

    /// Waiting in the display queue or held by the consumer.
    pub fn is_pending_display(self) -> bool {
        matches!(self, Self::ReadyForDisplay | Self::MappedForConsumption)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How an acquire was satisfied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Acquired {
    /// The slot was free and now holds a new picture.
    Fresh,
    /// Second field joined the slot its first field is decoding into.
    JoinedField,
}

#[derive(Copy, Clone, Debug, Default)]
struct Slot {
    state: SlotState,
    /// Field components outstanding: 1 for frames, 2 for a field pair.
    ref_count: u8,
}

struct PoolState {
    slots: Vec<Slot>,
    closed: bool,
    busy: usize,
    peak_busy: usize,
}

impl PoolState {
    fn set_busy(&mut self, index: usize, ref_count: u8) {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Decoding;
        slot.ref_count = ref_count;
        self.busy += 1;
        self.peak_busy = self.peak_busy.max(self.busy);
    }

    fn set_free(&mut self, index: usize) {
        self.slots[index] = Slot::default();
        self.busy -= 1;
    }
}

/// Point-in-time view of the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub decoding: usize,
    pub ready: usize,
    pub mapped: usize,
    /// Slots outside Free.
    pub busy: usize,
    /// High-water mark of `busy` since creation.
    pub peak_busy: usize,
    pub closed: bool,
}

/// Bounded pool of decode surfaces with blocking acquire.
pub struct SurfacePool {
    state: Mutex<PoolState>,
    /// One condition variable per slot, all paired with `state`.
    freed: Vec<Condvar>,
}

impl SurfacePool {
    /// Create a pool of `capacity` free slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "surface pool capacity must be > 0");
        Self {
            state: Mutex::new(PoolState {
                slots: vec![Slot::default(); capacity],
                closed: false,
                busy: 0,
                peak_busy: 0,
            }),
            freed: (0..capacity).map(|_| Condvar::new()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.freed.len()
    }

    /// Take slot `index` for decoding, blocking while it is in use.
    ///
    /// A second field arriving for a slot whose first field is still
    /// decoding joins that slot instead of waiting on itself.
    ///
    /// Returns [`SyncError::Closed`] if the pool is closed before (or while)
    /// waiting.
    pub fn acquire(&self, index: usize, role: FieldRole) -> Result<Acquired, SyncError> {
        self.check_index(index)?;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(SyncError::Closed);
            }
            let slot = state.slots[index];
            match slot.state {
                SlotState::Free => {
                    state.set_busy(index, 1);
                    trace!(slot = index, ?role, "Slot acquired");
                    return Ok(Acquired::Fresh);
                }
                SlotState::Decoding if role == FieldRole::SecondField && slot.ref_count == 1 => {
                    state.slots[index].ref_count = 2;
                    trace!(slot = index, "Second field joined slot");
                    return Ok(Acquired::JoinedField);
                }
                busy => {
                    trace!(slot = index, state = %busy, "Waiting for slot");
                    self.freed[index].wait(&mut state);
                }
            }
        }
    }

    /// Decoding → ReadyForDisplay. The only way a slot becomes eligible
    /// for the display queue.
    pub fn mark_ready_for_display(
        &self,
        index: usize,
        metadata: DisplayMetadata,
    ) -> Result<DisplayEntry, SyncError> {
        self.transition(index, SlotState::Decoding, SlotState::ReadyForDisplay)?;
        Ok(DisplayEntry::new(index, metadata))
    }

    /// ReadyForDisplay → MappedForConsumption, when the consumer pulls the
    /// entry.
    pub fn mark_mapped(&self, index: usize) -> Result<(), SyncError> {
        self.transition(
            index,
            SlotState::ReadyForDisplay,
            SlotState::MappedForConsumption,
        )
    }

    /// MappedForConsumption → Free. Wakes one waiter for this slot.
    ///
    /// Releasing a slot that is already free is reported as
    /// [`ContractViolation::DoubleRelease`].
    pub fn release(&self, index: usize) -> Result<(), SyncError> {
        self.check_index(index)?;
        let mut state = self.state.lock();
        match state.slots[index].state {
            SlotState::MappedForConsumption => {
                state.set_free(index);
                drop(state);
                self.freed[index].notify_one();
                trace!(slot = index, "Slot released");
                Ok(())
            }
            SlotState::Free => {
                drop(state);
                Err(Self::violation(ContractViolation::DoubleRelease(index)))
            }
            other => {
                drop(state);
                Err(Self::violation(ContractViolation::InvalidTransition {
                    index,
                    from: other.name(),
                    to: SlotState::Free.name(),
                }))
            }
        }
    }

    /// Return a slot to Free from any in-flight state without going
    /// through the consumer (failed decode, rejected display, teardown).
    ///
    /// Returns `false` if the slot was already free.
    pub fn discard(&self, index: usize) -> Result<bool, SyncError> {
        self.check_index(index)?;
        let mut state = self.state.lock();
        if state.slots[index].state == SlotState::Free {
            return Ok(false);
        }
        state.set_free(index);
        drop(state);
        self.freed[index].notify_one();
        Ok(true)
    }

    /// Refuse further acquires and wake every blocked acquirer. One-way.
    ///
    /// Releases and discards keep working so the consumer can return the
    /// slots it still holds.
    pub fn close(&self) {
        self.state.lock().closed = true;
        for cv in &self.freed {
            cv.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.state.lock().slots.get(index).map(|s| s.state)
    }

    /// Field components outstanding in `index` (0 when free).
    pub fn ref_count(&self, index: usize) -> Option<u8> {
        self.state.lock().slots.get(index).map(|s| s.ref_count)
    }

    /// Slots waiting in the display queue or held by the consumer.
    pub fn pending_display(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.state.is_pending_display())
            .count()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        let count = |want: SlotState| state.slots.iter().filter(|s| s.state == want).count();
        PoolSnapshot {
            capacity: state.slots.len(),
            decoding: count(SlotState::Decoding),
            ready: count(SlotState::ReadyForDisplay),
            mapped: count(SlotState::MappedForConsumption),
            busy: state.busy,
            peak_busy: state.peak_busy,
            closed: state.closed,
        }
    }

    // ── internal helpers ──────────────────────────────────────────

    fn check_index(&self, index: usize) -> Result<(), SyncError> {
        if index < self.capacity() {
            Ok(())
        } else {
            Err(Self::violation(ContractViolation::SlotOutOfRange {
                index,
                capacity: self.capacity(),
            }))
        }
    }

    fn transition(&self, index: usize, from: SlotState, to: SlotState) -> Result<(), SyncError> {
        self.check_index(index)?;
        let mut state = self.state.lock();
        let current = state.slots[index].state;
        if current != from {
            drop(state);
            return Err(Self::violation(ContractViolation::InvalidTransition {
                index,
                from: current.name(),
                to: to.name(),
            }));
        }
        state.slots[index].state = to;
        Ok(())
    }

    fn violation(violation: ContractViolation) -> SyncError {
        error!("Surface pool contract violation: {violation}");
        SyncError::ContractViolation(violation)
    }
}

impl fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("SurfacePool")
            .field("capacity", &snap.capacity)
            .field("busy", &snap.busy)
            .field("closed", &snap.closed)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crossbeam::channel;

    fn meta() -> DisplayMetadata {
        DisplayMetadata::progressive(None)
    }

    /// Drive a slot all the way to MappedForConsumption.
    fn to_mapped(pool: &SurfacePool, index: usize) {
        pool.acquire(index, FieldRole::Frame).unwrap();
        pool.mark_ready_for_display(index, meta()).unwrap();
        pool.mark_mapped(index).unwrap();
    }

    // ── Construction ─────────────────────────────────────────────

    #[test]
    fn new_pool_is_all_free() {
        let pool = SurfacePool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert!((0..4).all(|i| pool.slot_state(i) == Some(SlotState::Free)));
        assert_eq!(pool.snapshot().busy, 0);
    }

    #[test]
    #[should_panic(expected = "surface pool capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = SurfacePool::new(0);
    }

    // ── Lifecycle ────────────────────────────────────────────────

    #[test]
    fn full_lifecycle() {
        let pool = SurfacePool::new(2);
        assert_eq!(pool.acquire(1, FieldRole::Frame), Ok(Acquired::Fresh));
        assert_eq!(pool.slot_state(1), Some(SlotState::Decoding));

        let entry = pool
            .mark_ready_for_display(1, DisplayMetadata::progressive(Some(42)))
            .unwrap();
        assert_eq!(entry.slot, 1);
        assert_eq!(entry.timestamp, Some(42));
        assert_eq!(pool.slot_state(1), Some(SlotState::ReadyForDisplay));

        pool.mark_mapped(1).unwrap();
        assert_eq!(pool.slot_state(1), Some(SlotState::MappedForConsumption));

        pool.release(1).unwrap();
        assert_eq!(pool.slot_state(1), Some(SlotState::Free));
        assert_eq!(pool.snapshot().busy, 0);
        assert_eq!(pool.snapshot().peak_busy, 1);
    }

    #[test]
    fn mark_ready_requires_decoding() {
        let pool = SurfacePool::new(2);
        let err = pool.mark_ready_for_display(0, meta()).unwrap_err();
        assert_eq!(
            err,
            SyncError::ContractViolation(ContractViolation::InvalidTransition {
                index: 0,
                from: "Free",
                to: "ReadyForDisplay",
            })
        );
    }

    #[test]
    fn release_requires_mapped() {
        let pool = SurfacePool::new(2);
        pool.acquire(0, FieldRole::Frame).unwrap();
        pool.mark_ready_for_display(0, meta()).unwrap();
        let err = pool.release(0).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(pool.slot_state(0), Some(SlotState::ReadyForDisplay));
    }

    // ── Contract violations ──────────────────────────────────────

    #[test]
    fn double_release_is_detected() {
        let pool = SurfacePool::new(2);
        to_mapped(&pool, 0);
        pool.release(0).unwrap();
        assert_eq!(
            pool.release(0),
            Err(SyncError::ContractViolation(
                ContractViolation::DoubleRelease(0)
            ))
        );
    }

    #[test]
    fn out_of_range_index_is_a_violation() {
        let pool = SurfacePool::new(3);
        let expected = SyncError::ContractViolation(ContractViolation::SlotOutOfRange {
            index: 3,
            capacity: 3,
        });
        assert_eq!(pool.acquire(3, FieldRole::Frame), Err(expected.clone()));
        assert_eq!(pool.release(3), Err(expected.clone()));
        assert_eq!(pool.mark_mapped(3), Err(expected));
        assert_eq!(pool.slot_state(3), None);
    }

    // ── Field pairs ──────────────────────────────────────────────

    #[test]
    fn second_field_joins_decoding_slot() {
        let pool = SurfacePool::new(2);
        assert_eq!(pool.acquire(0, FieldRole::FirstField), Ok(Acquired::Fresh));
        assert_eq!(pool.ref_count(0), Some(1));
        assert_eq!(
            pool.acquire(0, FieldRole::SecondField),
            Ok(Acquired::JoinedField)
        );
        assert_eq!(pool.ref_count(0), Some(2));
        assert_eq!(pool.snapshot().busy, 1);
    }

    #[test]
    fn second_field_on_free_slot_is_fresh() {
        let pool = SurfacePool::new(1);
        assert_eq!(pool.acquire(0, FieldRole::SecondField), Ok(Acquired::Fresh));
    }

    // ── Blocking / backpressure ──────────────────────────────────

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(SurfacePool::new(1));
        to_mapped(&pool, 0);

        let (tx, rx) = channel::bounded(1);
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let res = pool.acquire(0, FieldRole::Frame);
                tx.send(res).unwrap();
            })
        };

        // Still held by the consumer: the acquirer must be parked.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pool.release(0).unwrap();
        let res = rx.recv_timeout(Duration::from_secs(5)).expect("acquire never woke");
        assert_eq!(res, Ok(Acquired::Fresh));
        assert_eq!(pool.slot_state(0), Some(SlotState::Decoding));
        waiter.join().unwrap();
    }

    #[test]
    fn release_only_wakes_matching_slot() {
        let pool = Arc::new(SurfacePool::new(2));
        to_mapped(&pool, 0);
        to_mapped(&pool, 1);

        let (tx, rx) = channel::bounded(1);
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || tx.send(pool.acquire(0, FieldRole::Frame)).unwrap())
        };

        pool.release(1).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pool.release(0).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Ok(Acquired::Fresh)
        );
        waiter.join().unwrap();
    }

    #[test]
    fn close_wakes_every_waiter() {
        let pool = Arc::new(SurfacePool::new(2));
        to_mapped(&pool, 0);
        to_mapped(&pool, 1);

        let (tx, rx) = channel::unbounded();
        let waiters: Vec<_> = (0..2)
            .map(|i| {
                let pool = pool.clone();
                let tx = tx.clone();
                thread::spawn(move || tx.send(pool.acquire(i, FieldRole::Frame)).unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        pool.close();

        for _ in 0..2 {
            let res = rx.recv_timeout(Duration::from_secs(5)).expect("waiter not woken");
            assert_eq!(res, Err(SyncError::Closed));
        }
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn release_still_works_after_close() {
        let pool = SurfacePool::new(1);
        to_mapped(&pool, 0);
        pool.close();
        pool.release(0).unwrap();
        assert_eq!(pool.acquire(0, FieldRole::Frame), Err(SyncError::Closed));
    }

    // ── Discard / snapshot ───────────────────────────────────────

    #[test]
    fn discard_frees_any_state() {
        let pool = SurfacePool::new(3);
        pool.acquire(0, FieldRole::Frame).unwrap();
        pool.acquire(1, FieldRole::Frame).unwrap();
        pool.mark_ready_for_display(1, meta()).unwrap();
        to_mapped(&pool, 2);

        assert_eq!(pool.pending_display(), 2);
        for i in 0..3 {
            assert_eq!(pool.discard(i), Ok(true));
        }
        assert_eq!(pool.discard(0), Ok(false));
        assert_eq!(pool.snapshot().busy, 0);
        assert_eq!(pool.pending_display(), 0);
    }

    #[test]
    fn snapshot_counts_states() {
        let pool = SurfacePool::new(4);
        pool.acquire(0, FieldRole::Frame).unwrap();
        pool.acquire(1, FieldRole::Frame).unwrap();
        pool.mark_ready_for_display(1, meta()).unwrap();
        to_mapped(&pool, 2);

        let snap = pool.snapshot();
        assert_eq!(snap.capacity, 4);
        assert_eq!(snap.decoding, 1);
        assert_eq!(snap.ready, 1);
        assert_eq!(snap.mapped, 1);
        assert_eq!(snap.busy, 3);
        assert_eq!(snap.peak_busy, 3);
        assert!(!snap.closed);
    }
}
