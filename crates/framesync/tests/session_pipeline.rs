//! End-to-end sessions: scripted demuxer → source driver thread →
//! synthetic engine callbacks → synchronizer → consumer thread.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use vs_common::{ContractViolation, FieldOrder, SyncError};
use vs_decoder::{SyntheticConfig, SyntheticEngine, SyntheticScan};
use vs_framesync::{DriverOutcome, FrameSynchronizer, Phase, Pull, Session};

fn open(
    engine: Arc<SyntheticEngine>,
    field_order: FieldOrder,
    frames: i64,
    surfaces: usize,
) -> Arc<Session> {
    let demuxer = ScriptedDemuxer::frames(stream_info(field_order), frames);
    let session = Session::open(engine, Box::new(demuxer), None, config(surfaces, 1)).unwrap();
    Arc::new(session)
}

// ── Ordering ──

#[test]
fn frames_arrive_in_presentation_order() {
    let engine = synthetic(2, SyntheticScan::Progressive);
    let mut script = Vec::new();
    // Decode order of an IBBP-style stream (pts in ms).
    for pts in [0, 99, 33, 66, 198, 132, 165] {
        script.push(Ok(packet(pts)));
    }
    let demuxer = ScriptedDemuxer::new(stream_info(FieldOrder::Progressive), script);
    let session = Arc::new(
        Session::open(engine, Box::new(demuxer), None, config(8, 2)).unwrap(),
    );
    session.start().unwrap();

    let consumer = session.clone();
    let seen = within_deadline(move || consume_all(&consumer));

    // 1 ms in the 10 MHz engine clock is 10_000 ticks.
    let expected: Vec<Option<i64>> = [0, 33, 66, 99, 132, 165, 198]
        .iter()
        .map(|ms| Some(ms * 10_000))
        .collect();
    assert_eq!(seen, expected);
    assert!(session.is_finished());
}

// ── Backpressure ──

#[test]
fn three_surfaces_ten_frames() {
    let engine = synthetic(1, SyntheticScan::Progressive);
    let session = open(engine.clone(), FieldOrder::Progressive, 10, 3);
    session.start().unwrap();

    let consumer = session.clone();
    let seen = within_deadline(move || {
        let mut seen = 0;
        loop {
            match consumer.pull_lease_timeout(Duration::from_millis(20)).unwrap() {
                Pull::Frame(lease) => {
                    // Hold the slot briefly so the decoder runs into it.
                    thread::sleep(Duration::from_millis(2));
                    lease.release().unwrap();
                    seen += 1;
                }
                Pull::WouldBlock => {}
                Pull::EndOfStream => return seen,
            }
        }
    });

    assert_eq!(seen, 10);
    let stats = session.stats();
    assert_eq!(stats.decoded, 10);
    assert_eq!(stats.released, 10);
    assert!(stats.peak_slots_busy <= 3, "peak {}", stats.peak_slots_busy);
    assert_eq!(stats.phase, Phase::Closed);
    assert_eq!(engine.stats().decode_callbacks, 10);
}

#[test]
fn single_surface_still_makes_progress() {
    let engine = synthetic(0, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 5, 1);
    session.start().unwrap();

    let consumer = session.clone();
    let seen = within_deadline(move || consume_all(&consumer));
    assert_eq!(seen.len(), 5);
    assert_eq!(session.stats().peak_slots_busy, 1);
}

// ── End of stream ──

#[test]
fn queued_entries_drain_after_end_of_input() {
    let engine = synthetic(0, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 3, 8);
    session.start().unwrap();

    let sync = session.synchronizer().clone();
    within_deadline(move || {
        while !sync.is_decode_finished() {
            thread::sleep(Duration::from_millis(1));
        }
    });
    assert_eq!(session.stats().queued, 3);
    assert!(!session.is_finished());

    let mut leases = Vec::new();
    for _ in 0..3 {
        match session.pull_lease().unwrap() {
            Pull::Frame(lease) => leases.push(lease),
            other => panic!("expected a frame, got {other:?}"),
        }
    }
    assert!(session.pull_frame().unwrap().is_end_of_stream());
    // Still draining while the consumer holds surfaces.
    assert_eq!(session.stats().phase, Phase::Draining);

    drop(leases);
    assert!(session.is_finished());
    session.stop();
    assert_eq!(
        session.driver_report().map(|r| r.outcome),
        Some(DriverOutcome::EndOfInput)
    );
}

#[test]
fn wait_finished_observes_background_consumer() {
    let engine = synthetic(1, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 12, 4);
    session.start().unwrap();

    let consumer = session.clone();
    let handle = thread::spawn(move || consume_all(&consumer).len());
    assert!(session.wait_finished(DEADLINE));
    assert_eq!(handle.join().unwrap(), 12);
}

#[test]
fn double_release_is_reported() {
    let engine = synthetic(0, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 1, 4);
    session.start().unwrap();

    let consumer = session.clone();
    let slot = within_deadline(move || loop {
        if let Pull::Frame(entry) = consumer.pull_frame_timeout(Duration::from_millis(20)).unwrap() {
            return entry.slot;
        }
    });
    session.release_frame(slot).unwrap();
    let err = session.release_frame(slot).unwrap_err();
    assert_eq!(
        err,
        SyncError::ContractViolation(ContractViolation::DoubleRelease(slot))
    );
    assert!(err.is_contract_violation());
}

// ── Field structure ──

/// Pull every lease and map each of its passes; returns passes per entry.
fn present_all(session: &Session) -> Vec<u32> {
    let mut passes = Vec::new();
    loop {
        match session.pull_lease_timeout(Duration::from_millis(20)).unwrap() {
            Pull::Frame(lease) => {
                let mut mapped = 0;
                for pass in lease.field_passes() {
                    let surface = session.map_pass(&lease, pass).unwrap();
                    assert_eq!(surface.field_index, pass.index);
                    assert_eq!(surface.slot, lease.slot());
                    mapped += 1;
                }
                assert_eq!(mapped, lease.passes());
                passes.push(mapped);
            }
            Pull::WouldBlock => {}
            Pull::EndOfStream => return passes,
        }
    }
}

#[test]
fn interlaced_entries_present_two_passes() {
    let engine = synthetic(1, SyntheticScan::FromStream);
    let session = open(engine.clone(), FieldOrder::TopFieldFirst, 4, 4);
    session.start().unwrap();

    let consumer = session.clone();
    let passes = within_deadline(move || present_all(&consumer));
    assert_eq!(passes, [2, 2, 2, 2]);

    // Two decode callbacks per picture, but one decode per slot.
    assert_eq!(engine.stats().decode_callbacks, 8);
    assert_eq!(session.stats().decoded, 4);
    for slot in 0..4 {
        assert_eq!(engine.mapped(slot), 0);
    }
}

#[test]
fn pulldown_entries_alternate_three_and_two_passes() {
    let engine = synthetic(0, SyntheticScan::Pulldown);
    let session = open(engine.clone(), FieldOrder::Progressive, 4, 4);
    session.start().unwrap();

    let consumer = session.clone();
    let passes = within_deadline(move || present_all(&consumer));
    assert_eq!(passes, [3, 2, 3, 2]);

    let stats = engine.stats();
    assert_eq!(stats.maps, 10);
    assert_eq!(stats.unmaps, 10);
}

// ── Format changes ──

#[test]
fn resolution_change_ends_stream_without_new_entries() {
    let engine = Arc::new(SyntheticEngine::new(SyntheticConfig {
        display_delay: 0,
        scan: SyntheticScan::Progressive,
        format_change_at: Some(3),
        ..SyntheticConfig::default()
    }));
    let session = open(engine, FieldOrder::Progressive, 6, 8);
    session.start().unwrap();

    let consumer = session.clone();
    let seen = within_deadline(move || consume_all(&consumer));
    assert_eq!(seen.len(), 3);
    assert!(session.synchronizer().is_halted());

    session.stop();
    let report = session.driver_report().unwrap();
    assert_eq!(report.outcome, DriverOutcome::Rejected);
    assert_eq!(report.packets_fed, 3);
}

// ── Teardown ──

#[test]
fn stop_unblocks_decoder_waiting_for_surfaces() {
    let engine = synthetic(0, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 50, 2);
    session.start().unwrap();

    // Nobody consumes: the driver ends up blocked in acquire.
    let sync = session.synchronizer().clone();
    within_deadline(move || {
        while sync.stats().queued < 2 {
            thread::sleep(Duration::from_millis(1));
        }
    });

    let stopper = session.clone();
    within_deadline(move || stopper.stop());

    let report = session.driver_report().unwrap();
    assert!(matches!(
        report.outcome,
        DriverOutcome::Rejected | DriverOutcome::Stopped
    ));
    assert!(report.packets_fed < 50);
    // Queued entries were discarded by the teardown.
    assert!(session.pull_frame().unwrap().is_end_of_stream());
    assert!(session.is_finished());

    // Idempotent.
    session.stop();
}

#[test]
fn dropping_a_running_session_joins_the_driver() {
    let engine = synthetic(0, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 50, 2);
    session.start().unwrap();
    let sync: Arc<FrameSynchronizer> = session.synchronizer().clone();

    within_deadline(move || drop(session));
    assert!(sync.is_decode_finished());
    assert_eq!(sync.stats().queued, 0);
}

#[test]
fn start_twice_is_harmless() {
    let engine = synthetic(0, SyntheticScan::Progressive);
    let session = open(engine, FieldOrder::Progressive, 2, 4);
    session.start().unwrap();
    session.start().unwrap();

    let consumer = session.clone();
    assert_eq!(within_deadline(move || consume_all(&consumer)).len(), 2);
}
