//! Frame Synchronizer — binds the surface pool and display queue.
//!
//! The decode engine drives the producer side through [`DecodeCallbacks`];
//! the render loop drives the consumer side through [`consumer_pull`] and
//! [`consumer_release`] (or the scoped [`pull_lease`]).
//!
//! Producer: `on_picture_decode` blocks in [`SurfacePool::acquire`] until the
//! requested slot is free; `on_picture_display` marks the slot ready and
//! queues a [`DisplayEntry`]. Consumer: a pulled entry's slot moves to
//! MappedForConsumption and stays there until released.
//!
//! End of stream closes both the queue (no new entries, queued ones still
//! drain) and the pool (every blocked acquirer wakes with
//! [`SyncError::Closed`]). The pool and queue locks are never held together.
//!
//! [`consumer_pull`]: FrameSynchronizer::consumer_pull
//! [`consumer_release`]: FrameSynchronizer::consumer_release
//! [`pull_lease`]: FrameSynchronizer::pull_lease

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use vs_common::{
    DecodeCallbacks, DecodeDecision, DisplayMetadata, PictureParams, SequenceFormat, StreamInfo,
    SyncError,
};

use crate::lease::FrameLease;
use crate::pool::{Acquired, SurfacePool};
use crate::queue::{DisplayEntry, DisplayQueue, QueuePop};
use crate::stream::{Phase, StreamState};

/// Result of a consumer pull.
#[derive(Debug, PartialEq, Eq)]
pub enum Pull<F = DisplayEntry> {
    Frame(F),
    /// Decode finished and every queued entry has been handed out.
    EndOfStream,
    /// Nothing ready yet.
    WouldBlock,
}

impl<F> Pull<F> {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    pub fn map<G>(self, f: impl FnOnce(F) -> G) -> Pull<G> {
        match self {
            Self::Frame(frame) => Pull::Frame(f(frame)),
            Self::EndOfStream => Pull::EndOfStream,
            Self::WouldBlock => Pull::WouldBlock,
        }
    }
}

/// Counters and occupancy of a synchronizer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Pictures decoded into a fresh slot.
    pub decoded: u64,
    /// Entries pushed to the display queue.
    pub displayed: u64,
    /// Slots released by the consumer.
    pub released: u64,
    /// Display callbacks refused (after end of stream or format halt).
    pub rejected_displays: u64,
    pub queued: usize,
    pub slots_busy: usize,
    pub peak_slots_busy: usize,
    pub phase: Phase,
}

/// Producer/consumer coordination for one decode session.
pub struct FrameSynchronizer {
    pool: SurfacePool,
    queue: DisplayQueue,
    stream: StreamState,
    /// Expected (then accepted) sequence format.
    format: Mutex<Option<SequenceFormat>>,
}

impl FrameSynchronizer {
    /// Create a synchronizer over `capacity` decode surfaces.
    ///
    /// When `expected` is set, the first sequence callback must match it.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, expected: Option<SequenceFormat>) -> Self {
        Self {
            pool: SurfacePool::new(capacity),
            queue: DisplayQueue::new(),
            stream: StreamState::new(),
            format: Mutex::new(expected),
        }
    }

    /// Synchronizer expecting the format the demuxer probed.
    pub fn for_stream(info: &StreamInfo, capacity: usize) -> Self {
        Self::new(capacity, Some(info.sequence_format()))
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn pool(&self) -> &SurfacePool {
        &self.pool
    }

    pub fn queue(&self) -> &DisplayQueue {
        &self.queue
    }

    /// The sequence format currently accepted (or expected).
    pub fn format(&self) -> Option<SequenceFormat> {
        *self.format.lock()
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Latch decode-finished, close the queue for new entries and wake every
    /// blocked acquirer. Idempotent.
    pub fn end_of_stream(&self) {
        if self.stream.finish() {
            info!(
                decoded = self.stream.decoded(),
                displayed = self.stream.displayed(),
                "End of stream"
            );
        }
        self.queue.close();
        self.pool.close();
    }

    /// End of stream plus teardown: queued entries are discarded and their
    /// slots freed. Slots the consumer holds are released by the consumer.
    pub fn shutdown(&self) {
        self.end_of_stream();
        let dropped = self.queue.drain();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Discarding queued entries on shutdown");
        }
        for entry in dropped {
            self.drop_picture(entry.slot);
        }
    }

    /// Decode finished (normally, by stop, or by a producer failure).
    pub fn is_decode_finished(&self) -> bool {
        self.stream.is_finished()
    }

    /// A mid-stream format change was rejected.
    pub fn is_halted(&self) -> bool {
        self.stream.is_halted()
    }

    pub fn phase(&self) -> Phase {
        if !self.stream.is_finished() {
            return Phase::Active;
        }
        // Queue and pool are inspected one after the other, never together.
        if self.queue.is_empty() && self.pool.pending_display() == 0 {
            Phase::Closed
        } else {
            Phase::Draining
        }
    }

    /// True once decode finished and every picture has been consumed.
    pub fn is_finished(&self) -> bool {
        self.phase() == Phase::Closed
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Take the next entry without blocking. The entry's slot stays
    /// MappedForConsumption until [`consumer_release`](Self::consumer_release).
    pub fn consumer_pull(&self) -> Result<Pull, SyncError> {
        let popped = self.queue.try_pop();
        self.hand_out(popped)
    }

    /// Like [`consumer_pull`](Self::consumer_pull) but waits up to `timeout`
    /// for an entry.
    pub fn consumer_pull_timeout(&self, timeout: Duration) -> Result<Pull, SyncError> {
        let popped = self.queue.pop_timeout(timeout);
        self.hand_out(popped)
    }

    /// Return a pulled entry's slot to the pool. Exactly once per entry.
    pub fn consumer_release(&self, slot: usize) -> Result<(), SyncError> {
        self.pool.release(slot)?;
        self.stream.record_released();
        Ok(())
    }

    /// Scoped pull: the slot is released when the lease drops.
    pub fn pull_lease(&self) -> Result<Pull<FrameLease<'_>>, SyncError> {
        Ok(self
            .consumer_pull()?
            .map(|entry| FrameLease::new(self, entry)))
    }

    pub fn pull_lease_timeout(&self, timeout: Duration) -> Result<Pull<FrameLease<'_>>, SyncError> {
        Ok(self
            .consumer_pull_timeout(timeout)?
            .map(|entry| FrameLease::new(self, entry)))
    }

    pub fn stats(&self) -> SyncStats {
        let snap = self.pool.snapshot();
        SyncStats {
            decoded: self.stream.decoded(),
            displayed: self.stream.displayed(),
            released: self.stream.released(),
            rejected_displays: self.stream.rejected(),
            queued: self.queue.len(),
            slots_busy: snap.busy,
            peak_slots_busy: snap.peak_busy,
            phase: self.phase(),
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn hand_out(&self, popped: QueuePop) -> Result<Pull, SyncError> {
        match popped {
            QueuePop::Entry(entry) => {
                self.pool.mark_mapped(entry.slot)?;
                Ok(Pull::Frame(entry))
            }
            QueuePop::Empty => Ok(Pull::WouldBlock),
            QueuePop::Drained => Ok(Pull::EndOfStream),
        }
    }

    /// Free a slot whose picture will never reach the consumer.
    fn drop_picture(&self, slot: usize) {
        // Out-of-range is already logged by the pool.
        let _ = self.pool.discard(slot);
    }

    fn refuse_display(&self, slot: usize, reason: &'static str) -> DecodeDecision {
        self.drop_picture(slot);
        self.stream.record_rejected();
        debug!(slot, reason, "Display refused");
        DecodeDecision::Reject
    }

    /// Latch the halted state and end the stream.
    fn halt(&self) {
        if self.stream.halt() {
            warn!("Decode halted after rejected format change");
        }
        self.end_of_stream();
    }
}

impl DecodeCallbacks for FrameSynchronizer {
    fn on_sequence_format(&self, format: &SequenceFormat) -> Result<usize, SyncError> {
        if self.stream.is_halted() || self.stream.is_finished() {
            return Err(SyncError::Closed);
        }

        let mut current = self.format.lock();
        if let Some(expected) = *current {
            if !expected.same_configuration(format) {
                drop(current);
                warn!(
                    expected_codec = ?expected.codec,
                    expected_size = %expected.coded,
                    got_codec = ?format.codec,
                    got_size = %format.coded,
                    got_chroma = format.chroma_format.label(),
                    got_bit_depth = format.bit_depth,
                    "Rejecting mid-stream format change"
                );
                self.halt();
                return Err(SyncError::FormatMismatch {
                    expected: Box::new(expected),
                    got: Box::new(*format),
                });
            }
        }
        *current = Some(*format);
        drop(current);

        info!(
            codec = format.codec.display_name(),
            coded = %format.coded,
            chroma = format.chroma_format.label(),
            progressive = format.progressive,
            min_surfaces = format.min_surfaces,
            capacity = self.pool.capacity(),
            "Sequence accepted"
        );
        Ok(self.pool.capacity())
    }

    fn on_picture_decode(&self, picture: &PictureParams) -> DecodeDecision {
        if self.stream.is_halted() {
            return DecodeDecision::Reject;
        }
        match self.pool.acquire(picture.slot, picture.field) {
            Ok(Acquired::Fresh) => {
                let n = self.stream.record_decoded();
                debug!(slot = picture.slot, field = ?picture.field, n, "Decoding picture");
                DecodeDecision::Proceed
            }
            Ok(Acquired::JoinedField) => DecodeDecision::Proceed,
            Err(SyncError::Closed) => {
                debug!(slot = picture.slot, "Decode refused: synchronizer closed");
                DecodeDecision::Reject
            }
            Err(e) => {
                error!(slot = picture.slot, "Decode callback failed: {e}");
                self.end_of_stream();
                DecodeDecision::Reject
            }
        }
    }

    fn on_picture_display(&self, slot: usize, metadata: DisplayMetadata) -> DecodeDecision {
        if self.stream.is_halted() {
            return self.refuse_display(slot, "halted");
        }
        if self.queue.is_closed() {
            return self.refuse_display(slot, "end of stream");
        }

        let entry = match self.pool.mark_ready_for_display(slot, metadata) {
            Ok(entry) => entry,
            Err(e) => {
                error!(slot, "Display callback failed: {e}");
                self.end_of_stream();
                return DecodeDecision::Reject;
            }
        };

        // The queue may close between the check above and this push.
        if let Err(entry) = self.queue.push(entry) {
            return self.refuse_display(entry.slot, "end of stream");
        }

        let n = self.stream.record_displayed();
        debug!(
            slot,
            pts = metadata.timestamp,
            progressive = metadata.progressive,
            rff = metadata.repeat_first_field,
            n,
            "Picture queued for display"
        );
        DecodeDecision::Proceed
    }

    fn on_decode_failed(&self, slot: usize, reason: &str) {
        warn!(slot, reason, "Picture decode failed, freeing slot");
        self.drop_picture(slot);
    }
}

impl std::fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("pool", &self.pool)
            .field("queue", &self.queue)
            .field("phase", &self.phase())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use crossbeam::channel;
    use vs_common::{ChromaFormat, ContractViolation, FieldRole, Resolution, VideoCodec};

    use crate::pool::SlotState;

    fn format(width: u32, height: u32) -> SequenceFormat {
        SequenceFormat {
            codec: VideoCodec::H264,
            coded: Resolution::new(width, height),
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: 8,
            progressive: true,
            min_surfaces: 4,
        }
    }

    /// Run one picture through decode and display.
    fn produce(sync: &FrameSynchronizer, slot: usize, pts: i64) {
        assert_eq!(
            sync.on_picture_decode(&PictureParams::frame(slot)),
            DecodeDecision::Proceed
        );
        assert_eq!(
            sync.on_picture_display(slot, DisplayMetadata::progressive(Some(pts))),
            DecodeDecision::Proceed
        );
    }

    fn pull_entry(sync: &FrameSynchronizer) -> DisplayEntry {
        match sync.consumer_pull().unwrap() {
            Pull::Frame(entry) => entry,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    // ── Sequence format ──────────────────────────────────────────

    #[test]
    fn matching_format_is_accepted() {
        let sync = FrameSynchronizer::new(4, Some(format(1920, 1088)));
        assert_eq!(sync.on_sequence_format(&format(1920, 1088)), Ok(4));
        assert!(!sync.is_halted());
    }

    #[test]
    fn first_format_is_adopted_without_expectation() {
        let sync = FrameSynchronizer::new(2, None);
        assert_eq!(sync.on_sequence_format(&format(640, 480)), Ok(2));
        assert_eq!(sync.format(), Some(format(640, 480)));
        assert!(sync.on_sequence_format(&format(1280, 720)).is_err());
    }

    #[test]
    fn resolution_change_is_rejected_and_halts() {
        let sync = FrameSynchronizer::new(4, Some(format(1920, 1088)));
        produce(&sync, 0, 0);

        let err = sync.on_sequence_format(&format(1280, 720)).unwrap_err();
        assert!(matches!(err, SyncError::FormatMismatch { .. }));
        assert!(sync.is_halted());
        assert!(sync.is_decode_finished());

        // No further decode or display for the new configuration.
        assert_eq!(
            sync.on_picture_decode(&PictureParams::frame(1)),
            DecodeDecision::Reject
        );
        assert_eq!(
            sync.on_picture_display(1, DisplayMetadata::progressive(None)),
            DecodeDecision::Reject
        );
        assert_eq!(sync.stats().displayed, 1);

        // The entry queued before the change still drains.
        assert_eq!(pull_entry(&sync).slot, 0);
        assert_eq!(sync.consumer_pull().unwrap(), Pull::EndOfStream);
    }

    #[test]
    fn bit_depth_change_is_rejected() {
        let sync = FrameSynchronizer::new(4, Some(format(1920, 1088)));
        let mut ten_bit = format(1920, 1088);
        ten_bit.bit_depth = 10;
        assert!(matches!(
            sync.on_sequence_format(&ten_bit),
            Err(SyncError::FormatMismatch { .. })
        ));
        assert!(sync.is_halted());
    }

    // ── Producer / consumer ──────────────────────────────────────

    #[test]
    fn entries_are_served_in_display_order() {
        let sync = FrameSynchronizer::new(4, None);
        // Display callbacks arrive in presentation order even though the
        // engine decoded slot 2 first.
        sync.on_picture_decode(&PictureParams::frame(2));
        sync.on_picture_decode(&PictureParams::frame(0));
        sync.on_picture_decode(&PictureParams::frame(1));
        for (slot, pts) in [(0, 0), (1, 1), (2, 2)] {
            sync.on_picture_display(slot, DisplayMetadata::progressive(Some(pts)));
        }

        let order: Vec<_> = (0..3).map(|_| pull_entry(&sync).slot).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(sync.consumer_pull().unwrap(), Pull::WouldBlock);
    }

    #[test]
    fn pulled_slot_is_mapped_until_released() {
        let sync = FrameSynchronizer::new(2, None);
        produce(&sync, 1, 10);
        let entry = pull_entry(&sync);
        assert_eq!(
            sync.pool().slot_state(1),
            Some(SlotState::MappedForConsumption)
        );
        sync.consumer_release(entry.slot).unwrap();
        assert_eq!(sync.pool().slot_state(1), Some(SlotState::Free));
        assert_eq!(sync.stats().released, 1);
    }

    #[test]
    fn double_release_is_a_contract_violation() {
        let sync = FrameSynchronizer::new(2, None);
        produce(&sync, 0, 0);
        let entry = pull_entry(&sync);
        sync.consumer_release(entry.slot).unwrap();
        assert_eq!(
            sync.consumer_release(entry.slot),
            Err(SyncError::ContractViolation(
                ContractViolation::DoubleRelease(0)
            ))
        );
        assert_eq!(sync.stats().released, 1);
    }

    #[test]
    fn decode_blocks_on_unreleased_slot() {
        let sync = Arc::new(FrameSynchronizer::new(1, None));
        produce(&sync, 0, 0);
        let entry = pull_entry(&sync);

        let (tx, rx) = channel::bounded(1);
        let producer = {
            let sync = sync.clone();
            thread::spawn(move || {
                tx.send(sync.on_picture_decode(&PictureParams::frame(0)))
                    .unwrap()
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        sync.consumer_release(entry.slot).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DecodeDecision::Proceed
        );
        producer.join().unwrap();
    }

    // ── End of stream ────────────────────────────────────────────

    #[test]
    fn end_of_stream_drains_queued_entries() {
        let sync = FrameSynchronizer::new(4, None);
        for slot in 0..3 {
            produce(&sync, slot, slot as i64);
        }
        sync.end_of_stream();
        assert_eq!(sync.phase(), Phase::Draining);

        for slot in 0..3 {
            let entry = pull_entry(&sync);
            assert_eq!(entry.slot, slot);
            assert!(!sync.is_finished());
            sync.consumer_release(entry.slot).unwrap();
        }
        assert_eq!(sync.consumer_pull().unwrap(), Pull::EndOfStream);
        assert!(sync.is_finished());
        assert_eq!(sync.phase(), Phase::Closed);
    }

    #[test]
    fn no_entries_after_end_of_stream() {
        let sync = FrameSynchronizer::new(4, None);
        sync.on_picture_decode(&PictureParams::frame(0));
        sync.end_of_stream();

        assert_eq!(
            sync.on_picture_display(0, DisplayMetadata::progressive(None)),
            DecodeDecision::Reject
        );
        assert_eq!(sync.pool().slot_state(0), Some(SlotState::Free));
        assert_eq!(
            sync.on_picture_decode(&PictureParams::frame(1)),
            DecodeDecision::Reject
        );
        let stats = sync.stats();
        assert_eq!(stats.displayed, 0);
        assert_eq!(stats.rejected_displays, 1);
        assert_eq!(sync.consumer_pull().unwrap(), Pull::EndOfStream);
    }

    #[test]
    fn end_of_stream_wakes_blocked_decoder() {
        let sync = Arc::new(FrameSynchronizer::new(1, None));
        produce(&sync, 0, 0);

        let (tx, rx) = channel::bounded(1);
        let producer = {
            let sync = sync.clone();
            thread::spawn(move || {
                tx.send(sync.on_picture_decode(&PictureParams::frame(0)))
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(20));
        sync.end_of_stream();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DecodeDecision::Reject
        );
        producer.join().unwrap();
    }

    #[test]
    fn mapped_slot_keeps_phase_draining() {
        let sync = FrameSynchronizer::new(2, None);
        produce(&sync, 0, 0);
        let entry = pull_entry(&sync);
        sync.end_of_stream();

        assert_eq!(sync.consumer_pull().unwrap(), Pull::EndOfStream);
        assert_eq!(sync.phase(), Phase::Draining);
        sync.consumer_release(entry.slot).unwrap();
        assert_eq!(sync.phase(), Phase::Closed);
    }

    #[test]
    fn shutdown_discards_queue_but_not_held_slots() {
        let sync = FrameSynchronizer::new(4, None);
        for slot in 0..3 {
            produce(&sync, slot, slot as i64);
        }
        let held = pull_entry(&sync);
        sync.shutdown();

        assert_eq!(sync.consumer_pull().unwrap(), Pull::EndOfStream);
        assert_eq!(
            sync.pool().slot_state(held.slot),
            Some(SlotState::MappedForConsumption)
        );
        assert_eq!(sync.pool().slot_state(1), Some(SlotState::Free));
        sync.consumer_release(held.slot).unwrap();
        assert!(sync.is_finished());
    }

    #[test]
    fn decode_failure_frees_slot() {
        let sync = FrameSynchronizer::new(2, None);
        sync.on_picture_decode(&PictureParams::frame(1));
        sync.on_decode_failed(1, "bitstream error");
        assert_eq!(sync.pool().slot_state(1), Some(SlotState::Free));
    }

    #[test]
    fn out_of_range_decode_ends_stream() {
        let sync = FrameSynchronizer::new(2, None);
        assert_eq!(
            sync.on_picture_decode(&PictureParams::frame(5)),
            DecodeDecision::Reject
        );
        assert!(sync.is_decode_finished());
    }

    #[test]
    fn display_of_undecoded_slot_ends_stream() {
        let sync = FrameSynchronizer::new(2, None);
        assert_eq!(
            sync.on_picture_display(0, DisplayMetadata::progressive(None)),
            DecodeDecision::Reject
        );
        assert!(sync.is_decode_finished());
        assert!(sync.consumer_pull().unwrap().is_end_of_stream());
    }

    #[test]
    fn display_contract_violation_wakes_blocked_decoder() {
        let sync = Arc::new(FrameSynchronizer::new(1, None));
        produce(&sync, 0, 0);

        let (tx, rx) = channel::bounded(1);
        let producer = sync.clone();
        thread::spawn(move || {
            let _ = tx.send(producer.on_picture_decode(&PictureParams::frame(0)));
        });
        // Slot 0 is queued, so the decode above is parked. A display for a
        // slot that never decoded must still unpark it.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            sync.on_picture_display(3, DisplayMetadata::progressive(None)),
            DecodeDecision::Reject
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DecodeDecision::Reject
        );
        // The entry queued before the violation still drains.
        assert!(matches!(sync.consumer_pull().unwrap(), Pull::Frame(_)));
    }

    // ── Field pairs ──────────────────────────────────────────────

    #[test]
    fn field_pair_counts_one_decode() {
        let sync = FrameSynchronizer::new(2, None);
        let first = PictureParams {
            slot: 0,
            field: FieldRole::FirstField,
            keyframe: true,
        };
        let second = PictureParams {
            field: FieldRole::SecondField,
            ..first
        };
        assert_eq!(sync.on_picture_decode(&first), DecodeDecision::Proceed);
        assert_eq!(sync.on_picture_decode(&second), DecodeDecision::Proceed);
        sync.on_picture_display(0, DisplayMetadata::interlaced(Some(0), true, 1));

        let stats = sync.stats();
        assert_eq!(stats.decoded, 1);
        assert_eq!(stats.displayed, 1);
        assert_eq!(pull_entry(&sync).passes(), 3);
    }

    // ── Leases ───────────────────────────────────────────────────

    #[test]
    fn lease_releases_on_drop() {
        let sync = FrameSynchronizer::new(2, None);
        produce(&sync, 0, 0);
        {
            let Pull::Frame(lease) = sync.pull_lease().unwrap() else {
                panic!("expected a lease");
            };
            assert_eq!(lease.slot(), 0);
        }
        assert_eq!(sync.pool().slot_state(0), Some(SlotState::Free));
        assert_eq!(sync.stats().released, 1);
    }

    #[test]
    fn lease_releases_on_early_return() {
        fn consume(sync: &FrameSynchronizer) -> Result<(), &'static str> {
            let Pull::Frame(_lease) = sync.pull_lease().map_err(|_| "pull")? else {
                return Err("no frame");
            };
            Err("sink failed")
        }

        let sync = FrameSynchronizer::new(1, None);
        produce(&sync, 0, 0);
        assert_eq!(consume(&sync), Err("sink failed"));
        assert_eq!(sync.pool().slot_state(0), Some(SlotState::Free));
    }

    #[test]
    fn stats_track_peak_occupancy() {
        let sync = FrameSynchronizer::new(3, None);
        for slot in 0..3 {
            produce(&sync, slot, 0);
        }
        for _ in 0..3 {
            let entry = pull_entry(&sync);
            sync.consumer_release(entry.slot).unwrap();
        }
        let stats = sync.stats();
        assert_eq!(stats.peak_slots_busy, 3);
        assert_eq!(stats.slots_busy, 0);
        assert_eq!(stats.phase, Phase::Active);
    }
}
