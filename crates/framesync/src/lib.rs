//! `vs-framesync` — Frame synchronization between a hardware decode engine
//! and a presentation consumer.
//!
//! The decode engine produces pictures in decode order into a small,
//! fixed set of surfaces and announces them for display in presentation
//! order. This crate binds the two sides:
//!
//! - **SurfacePool**: per-slot lifecycle with blocking acquire (backpressure)
//! - **DisplayQueue**: FIFO of pictures ready for presentation
//! - **FrameSynchronizer**: engine callbacks, consumer pull/release, end of stream
//! - **SourceDriver**: demux → filter → feed loop on its own thread
//! - **Session**: owns all of the above for one stream

pub mod driver;
pub mod fields;
pub mod lease;
pub mod pool;
pub mod queue;
pub mod session;
pub mod stream;
pub mod synchronizer;

pub use driver::{rescale_pts, DriverOutcome, DriverReport, SourceDriver};
pub use fields::{field_passes, presentation_passes};
pub use lease::FrameLease;
pub use pool::{Acquired, PoolSnapshot, SlotState, SurfacePool};
pub use queue::{DisplayEntry, DisplayQueue, QueuePop};
pub use session::Session;
pub use stream::{Phase, StreamState};
pub use synchronizer::{FrameSynchronizer, Pull, SyncStats};
