//! The consumer side: pull, present every pass, release.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver};
use crossbeam::utils::Backoff;
use tracing::{debug, info};
use vs_framesync::{Pull, Session};

use crate::sink::FrameSink;

/// Interval between progress log lines.
const PROGRESS_EVERY: Duration = Duration::from_secs(2);

/// What the render loop presented.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderStats {
    /// Display entries pulled.
    pub entries: u64,
    /// Mapped passes handed to the sink, repeats included.
    pub passes: u64,
    /// Passes beyond the first of their entry.
    pub repeated: u64,
    pub elapsed: Duration,
    /// Stopped by the frame limit rather than end of stream.
    pub truncated: bool,
}

impl RenderStats {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.entries as f64 / secs
        } else {
            0.0
        }
    }
}

/// Drain `session` into `sink` until end of stream or `max_entries`.
pub fn render(
    session: &Session,
    sink: &mut dyn FrameSink,
    max_entries: Option<u64>,
) -> Result<RenderStats> {
    render_with_progress(session, sink, max_entries, channel::tick(PROGRESS_EVERY))
}

fn render_with_progress(
    session: &Session,
    sink: &mut dyn FrameSink,
    max_entries: Option<u64>,
    progress: Receiver<Instant>,
) -> Result<RenderStats> {
    let start = Instant::now();
    let poll = session.config().poll_interval();
    let backoff = Backoff::new();
    let mut stats = RenderStats::default();

    loop {
        if max_entries.is_some_and(|limit| stats.entries >= limit) {
            info!(entries = stats.entries, "Frame limit reached");
            stats.truncated = true;
            break;
        }
        if progress.try_recv().is_ok() {
            info!(
                entries = stats.entries,
                passes = stats.passes,
                queued = session.stats().queued,
                "Presenting"
            );
        }

        let lease = match session.pull_lease().context("Pull from synchronizer failed")? {
            Pull::Frame(lease) => lease,
            Pull::WouldBlock => {
                if backoff.is_completed() {
                    thread::sleep(poll);
                } else {
                    backoff.snooze();
                }
                continue;
            }
            Pull::EndOfStream => break,
        };
        backoff.reset();

        for pass in lease.field_passes() {
            let surface = session
                .map_pass(&lease, pass)
                .with_context(|| format!("Map of slot {} pass {} failed", lease.slot(), pass.index))?;
            sink.present(&surface, lease.timestamp())?;
            surface.unmap().context("Unmap failed")?;
            stats.passes += 1;
            if pass.index > 0 {
                stats.repeated += 1;
            }
        }
        debug!(slot = lease.slot(), pts = lease.timestamp(), passes = lease.passes(), "Presented");
        lease.release().context("Release failed")?;
        stats.entries += 1;
    }

    sink.finish()?;
    stats.elapsed = start.elapsed();
    Ok(stats)
}
