//! Session — owns one decode pipeline.
//!
//! A session holds the synchronizer, the engine handle and the source
//! driver thread. There is no process-wide state; several sessions can run
//! side by side.
//!
//! ```text
//! Session::open ──▶ start() ──▶ [driver thread: demux → feed → callbacks]
//!                     │
//!     consumer: pull_frame / pull_lease ──▶ map_pass ──▶ release
//!                     │
//!                   stop()  (idempotent, also on Drop)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vs_common::{
    BitstreamFilter, DecodeCallbacks, DecodeEngine, DecodeError, Demuxer, EngineError,
    EngineResult, FieldPass, MappedSurface, SessionConfig, SyncError,
};

use crate::driver::{DriverReport, SourceDriver};
use crate::lease::FrameLease;
use crate::synchronizer::{FrameSynchronizer, Pull, SyncStats};

enum DriverSlot {
    /// Configured, not started.
    Idle(SourceDriver),
    Running(JoinHandle<DriverReport>),
    Joined(Option<DriverReport>),
}

/// One decode session.
pub struct Session {
    sync: Arc<FrameSynchronizer>,
    engine: Arc<dyn DecodeEngine>,
    driver: Mutex<DriverSlot>,
    stop: Arc<AtomicBool>,
    config: SessionConfig,
}

impl Session {
    /// Wire `sync` and `engine` together around `demuxer`.
    ///
    /// The engine is configured for the demuxer's stream with the
    /// synchronizer's capacity and the synchronizer as its callbacks.
    pub fn new(
        sync: Arc<FrameSynchronizer>,
        engine: Arc<dyn DecodeEngine>,
        demuxer: Box<dyn Demuxer>,
        filter: Option<Box<dyn BitstreamFilter>>,
        config: SessionConfig,
    ) -> EngineResult<Self> {
        let info = demuxer.stream_info().clone();
        let callbacks: Arc<dyn DecodeCallbacks> = sync.clone();
        engine.configure(&info, sync.capacity(), callbacks)?;

        let driver = SourceDriver::new(
            demuxer,
            filter,
            engine.clone(),
            sync.clone(),
            config.engine_time_base(),
        );
        let stop = driver.stop_flag();

        info!(
            engine = engine.name(),
            codec = info.codec.display_name(),
            coded = %info.coded,
            surfaces = sync.capacity(),
            "Session configured"
        );

        Ok(Self {
            sync,
            engine,
            driver: Mutex::new(DriverSlot::Idle(driver)),
            stop,
            config,
        })
    }

    /// Build the synchronizer from the demuxer's stream info and `config`.
    pub fn open(
        engine: Arc<dyn DecodeEngine>,
        demuxer: Box<dyn Demuxer>,
        filter: Option<Box<dyn BitstreamFilter>>,
        config: SessionConfig,
    ) -> EngineResult<Self> {
        let sync = Arc::new(FrameSynchronizer::for_stream(
            demuxer.stream_info(),
            config.surfaces(),
        ));
        Self::new(sync, engine, demuxer, filter, config)
    }

    /// Start the source driver thread. Starting twice is a no-op.
    pub fn start(&self) -> EngineResult<()> {
        let mut slot = self.driver.lock();
        let previous = std::mem::replace(&mut *slot, DriverSlot::Joined(None));
        match previous {
            DriverSlot::Idle(driver) => match driver.spawn() {
                Ok(handle) => {
                    *slot = DriverSlot::Running(handle);
                    debug!("Source driver thread spawned");
                    Ok(())
                }
                Err(e) => {
                    drop(slot);
                    self.sync.shutdown();
                    Err(EngineError::Io(e))
                }
            },
            other => {
                *slot = other;
                warn!("Session already started");
                Ok(())
            }
        }
    }

    /// Tear down: discard queued entries, wake blocked decoders, stop and
    /// join the driver. Idempotent.
    pub fn stop(&self) {
        self.sync.shutdown();
        self.stop.store(true, Ordering::Release);

        let mut slot = self.driver.lock();
        let previous = std::mem::replace(&mut *slot, DriverSlot::Joined(None));
        *slot = match previous {
            DriverSlot::Running(handle) => match handle.join() {
                Ok(report) => DriverSlot::Joined(Some(report)),
                Err(_) => {
                    warn!("Source driver thread panicked");
                    DriverSlot::Joined(None)
                }
            },
            DriverSlot::Idle(_) => DriverSlot::Joined(None),
            joined @ DriverSlot::Joined(_) => joined,
        };
    }

    /// True once decoding ended and every picture was consumed.
    pub fn is_finished(&self) -> bool {
        self.sync.is_finished()
    }

    /// Poll [`is_finished`](Self::is_finished) until it holds or `timeout`
    /// passes. For callers that let another component consume frames.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            if backoff.is_completed() {
                std::thread::sleep(self.config.poll_interval());
            } else {
                backoff.snooze();
            }
        }
        true
    }

    pub fn pull_frame(&self) -> Result<Pull, SyncError> {
        self.sync.consumer_pull()
    }

    pub fn pull_frame_timeout(&self, timeout: Duration) -> Result<Pull, SyncError> {
        self.sync.consumer_pull_timeout(timeout)
    }

    pub fn release_frame(&self, slot: usize) -> Result<(), SyncError> {
        self.sync.consumer_release(slot)
    }

    /// Scoped pull. The slot is released when the lease drops.
    pub fn pull_lease(&self) -> Result<Pull<FrameLease<'_>>, SyncError> {
        self.sync.pull_lease()
    }

    pub fn pull_lease_timeout(&self, timeout: Duration) -> Result<Pull<FrameLease<'_>>, SyncError> {
        self.sync.pull_lease_timeout(timeout)
    }

    /// Map one presentation pass of a leased picture.
    pub fn map_pass(
        &self,
        lease: &FrameLease<'_>,
        pass: FieldPass,
    ) -> Result<MappedSurface<'_>, DecodeError> {
        MappedSurface::map(&*self.engine, lease.slot(), pass)
    }

    pub fn stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Driver summary, available once the driver thread has been joined.
    pub fn driver_report(&self) -> Option<DriverReport> {
        match &*self.driver.lock() {
            DriverSlot::Joined(report) => report.clone(),
            _ => None,
        }
    }

    pub fn synchronizer(&self) -> &Arc<FrameSynchronizer> {
        &self.sync
    }

    pub fn engine(&self) -> &Arc<dyn DecodeEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine.name())
            .field("sync", &self.sync)
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
