//! Deterministic software decode engine.
//!
//! Behaves like the CUVID parser as seen from the callbacks, without a GPU:
//!
//! - one picture per non-empty packet, decoded into the next slot (round
//!   robin) that is not waiting in the reorder window;
//! - a reorder window of `display_delay` pictures, released in pts order;
//! - interlaced streams decode each picture as a field pair (two decode
//!   callbacks on the same slot);
//! - optional 3:2 pulldown cadence (`repeat_first_field` alternating 1, 0);
//! - an optional injected format change at a given packet;
//! - fake, stable device pointers for mapping.
//!
//! Like the NVDEC engine, callbacks run on the feeding thread with no lock
//! shared with `map_surface`/`unmap_surface`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use vs_common::{
    DecodeCallbacks, DecodeDecision, DecodeEngine, DecodeError, DisplayMetadata, FeedStatus,
    FieldPass, FieldRole, Packet, PictureParams, Resolution, SequenceFormat, SessionConfig,
    StreamInfo, SurfaceView,
};

/// Base of the fake device address space.
const DEVICE_BASE: u64 = 0x7f00_0000_0000;
/// Address stride between slots.
const SLOT_STRIDE: u64 = 0x0100_0000;
const PITCH_ALIGN: u32 = 256;

/// Picture structure the synthetic stream produces.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SyntheticScan {
    /// Progressive or interlaced depending on the stream's field order.
    #[default]
    FromStream,
    Progressive,
    /// Field pairs, no repeats.
    Interlaced,
    /// Frame-coded pictures displayed with a 3:2 cadence.
    Pulldown,
}

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Pictures held back before display.
    pub display_delay: usize,
    pub scan: SyntheticScan,
    /// 0-based packet index whose sequence header switches to a new size.
    pub format_change_at: Option<u64>,
    /// Minimum surface count reported with each sequence.
    pub min_surfaces: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            display_delay: 1,
            scan: SyntheticScan::FromStream,
            format_change_at: None,
            min_surfaces: 1,
        }
    }
}

impl SyntheticConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            display_delay: config.max_display_delay as usize,
            ..Self::default()
        }
    }
}

/// A decoded picture waiting in the reorder window.
#[derive(Copy, Clone, Debug)]
struct Pending {
    slot: usize,
    /// Display order key: pts, or decode order when pts is unknown.
    order: i64,
    timestamp: Option<i64>,
}

/// Feed-side state. Locked across callbacks.
struct Feeder {
    callbacks: Arc<dyn DecodeCallbacks>,
    format: SequenceFormat,
    scan: SyntheticScan,
    capacity: usize,
    cursor: usize,
    /// Slots whose picture is still in the reorder window.
    held: Vec<bool>,
    window: Vec<Pending>,
    packets: u64,
    sequenced: bool,
    rejected: bool,
    /// Next displayed pulldown picture repeats its first field.
    repeat_next: bool,
}

/// Map-side state. Never locked across callbacks.
#[derive(Default)]
struct Surfaces {
    output: Resolution,
    pitch: u32,
    mapped: Vec<u32>,
}

/// Software stand-in for the NVDEC engine.
pub struct SyntheticEngine {
    config: SyntheticConfig,
    feeder: Mutex<Option<Feeder>>,
    surfaces: Mutex<Surfaces>,
    stats: Mutex<SyntheticStats>,
}

/// Counters for tests and the player's summary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub packets: u64,
    pub sequences: u64,
    pub decode_callbacks: u64,
    pub display_callbacks: u64,
    pub maps: u64,
    pub unmaps: u64,
}

impl SyntheticEngine {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            feeder: Mutex::new(None),
            surfaces: Mutex::new(Surfaces::default()),
            stats: Mutex::new(SyntheticStats::default()),
        }
    }

    pub fn stats(&self) -> SyntheticStats {
        *self.stats.lock()
    }

    /// Passes currently mapped on `slot`.
    pub fn mapped(&self, slot: usize) -> u32 {
        self.surfaces.lock().mapped.get(slot).copied().unwrap_or(0)
    }

    /// Fake device pointer of `slot`'s luma plane.
    pub fn device_ptr(slot: usize) -> u64 {
        DEVICE_BASE + slot as u64 * SLOT_STRIDE
    }

    /// Offer a sequence header. `Err` leaves the feeder rejected.
    fn sequence(&self, feeder: &mut Feeder, format: SequenceFormat) -> Result<(), DecodeError> {
        self.stats.lock().sequences += 1;
        match feeder.callbacks.on_sequence_format(&format) {
            Ok(available) => {
                let capacity = available.min(feeder.held.len());
                if format.min_surfaces as usize > capacity {
                    feeder.rejected = true;
                    return Err(DecodeError::InsufficientSurfaces {
                        required: format.min_surfaces,
                        available: capacity,
                    });
                }
                feeder.capacity = capacity;
                feeder.sequenced = true;
                Ok(())
            }
            Err(e) => {
                debug!("Synthetic sequence rejected: {e}");
                feeder.rejected = true;
                Ok(())
            }
        }
    }

    fn next_slot(feeder: &mut Feeder) -> usize {
        let capacity = feeder.capacity;
        let slot = (0..capacity)
            .map(|i| (feeder.cursor + i) % capacity)
            .find(|&s| !feeder.held[s])
            .unwrap_or(feeder.cursor % capacity);
        feeder.cursor = (slot + 1) % capacity;
        slot
    }

    fn decode(&self, feeder: &mut Feeder, slot: usize, keyframe: bool) -> DecodeDecision {
        let roles: &[FieldRole] = match feeder.scan {
            SyntheticScan::Interlaced => &[FieldRole::FirstField, FieldRole::SecondField],
            _ => &[FieldRole::Frame],
        };
        for &field in roles {
            self.stats.lock().decode_callbacks += 1;
            let picture = PictureParams {
                slot,
                field,
                keyframe,
            };
            if !feeder.callbacks.on_picture_decode(&picture).is_proceed() {
                return DecodeDecision::Reject;
            }
        }
        DecodeDecision::Proceed
    }

    /// Display the window's earliest picture.
    fn display_next(&self, feeder: &mut Feeder) -> DecodeDecision {
        let Some(pos) = feeder
            .window
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.order)
            .map(|(i, _)| i)
        else {
            return DecodeDecision::Proceed;
        };
        let pending = feeder.window.remove(pos);
        feeder.held[pending.slot] = false;

        let metadata = match feeder.scan {
            SyntheticScan::Progressive | SyntheticScan::FromStream => {
                DisplayMetadata::progressive(pending.timestamp)
            }
            SyntheticScan::Interlaced => DisplayMetadata::interlaced(pending.timestamp, true, 0),
            SyntheticScan::Pulldown => {
                let rff = u32::from(feeder.repeat_next);
                feeder.repeat_next = !feeder.repeat_next;
                DisplayMetadata::interlaced(pending.timestamp, true, rff)
            }
        };
        self.stats.lock().display_callbacks += 1;
        trace!(slot = pending.slot, pts = ?pending.timestamp, "Synthetic display");
        feeder.callbacks.on_picture_display(pending.slot, metadata)
    }

    fn drain_window(&self, feeder: &mut Feeder, keep: usize) -> FeedStatus {
        while feeder.window.len() > keep {
            if !self.display_next(feeder).is_proceed() {
                feeder.rejected = true;
                return FeedStatus::Rejected;
            }
        }
        FeedStatus::Accepted
    }
}

impl DecodeEngine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn configure(
        &self,
        info: &StreamInfo,
        max_surfaces: usize,
        callbacks: Arc<dyn DecodeCallbacks>,
    ) -> Result<(), DecodeError> {
        if max_surfaces == 0 {
            return Err(DecodeError::InsufficientSurfaces {
                required: 1,
                available: 0,
            });
        }
        let scan = match self.config.scan {
            SyntheticScan::FromStream if !info.field_order.is_progressive() => {
                SyntheticScan::Interlaced
            }
            SyntheticScan::FromStream => SyntheticScan::Progressive,
            scan => scan,
        };
        let mut format = info.sequence_format();
        format.progressive = scan == SyntheticScan::Progressive;
        format.min_surfaces = self.config.min_surfaces;

        {
            let mut surfaces = self.surfaces.lock();
            surfaces.output = info.display;
            surfaces.pitch = info.display.width.div_ceil(PITCH_ALIGN) * PITCH_ALIGN;
            surfaces.mapped = vec![0; max_surfaces];
        }
        *self.feeder.lock() = Some(Feeder {
            callbacks,
            format,
            scan,
            capacity: max_surfaces,
            cursor: 0,
            held: vec![false; max_surfaces],
            window: Vec::with_capacity(self.config.display_delay + 1),
            packets: 0,
            sequenced: false,
            rejected: false,
            repeat_next: true,
        });

        info!(
            codec = info.codec.display_name(),
            surfaces = max_surfaces,
            delay = self.config.display_delay,
            scan = ?scan,
            "Synthetic engine configured"
        );
        Ok(())
    }

    fn feed(&self, packet: &Packet) -> Result<FeedStatus, DecodeError> {
        let mut guard = self.feeder.lock();
        let feeder = guard.as_mut().ok_or(DecodeError::NotConfigured)?;
        if feeder.rejected {
            return Ok(FeedStatus::Rejected);
        }
        if packet.is_empty() {
            return Ok(FeedStatus::Accepted);
        }

        let index = feeder.packets;
        feeder.packets += 1;
        self.stats.lock().packets += 1;

        if self.config.format_change_at == Some(index) {
            let mut changed = feeder.format;
            changed.coded = Resolution::new(changed.coded.width * 2, changed.coded.height * 2);
            debug!(packet = index, coded = %changed.coded, "Injecting format change");
            self.sequence(feeder, changed)?;
        } else if !feeder.sequenced {
            let format = feeder.format;
            self.sequence(feeder, format)?;
        }
        if feeder.rejected {
            return Ok(FeedStatus::Rejected);
        }

        // A full window must give up a picture before a slot can be chosen.
        let room = feeder.capacity.saturating_sub(1);
        if self.drain_window(feeder, room) == FeedStatus::Rejected {
            return Ok(FeedStatus::Rejected);
        }

        let slot = Self::next_slot(feeder);
        if !self.decode(feeder, slot, packet.is_keyframe).is_proceed() {
            feeder.rejected = true;
            return Ok(FeedStatus::Rejected);
        }
        feeder.held[slot] = true;
        feeder.window.push(Pending {
            slot,
            order: packet.pts.unwrap_or(index as i64),
            timestamp: packet.pts,
        });

        Ok(self.drain_window(feeder, self.config.display_delay))
    }

    fn flush(&self) -> Result<FeedStatus, DecodeError> {
        let mut guard = self.feeder.lock();
        let feeder = guard.as_mut().ok_or(DecodeError::NotConfigured)?;
        if feeder.rejected {
            return Ok(FeedStatus::Rejected);
        }
        debug!(pending = feeder.window.len(), "Flushing synthetic reorder window");
        Ok(self.drain_window(feeder, 0))
    }

    fn map_surface(&self, slot: usize, pass: FieldPass) -> Result<SurfaceView, DecodeError> {
        let mut surfaces = self.surfaces.lock();
        let output = surfaces.output;
        let pitch = surfaces.pitch;
        let count = surfaces.mapped.get_mut(slot).ok_or(DecodeError::MapFailed {
            slot,
            reason: "slot out of range".into(),
        })?;
        *count += 1;
        self.stats.lock().maps += 1;
        Ok(SurfaceView {
            slot,
            device_ptr: Self::device_ptr(slot),
            pitch,
            width: output.width,
            height: output.height,
            progressive: pass.progressive,
            field_index: pass.index,
        })
    }

    fn unmap_surface(&self, view: &SurfaceView) -> Result<(), DecodeError> {
        let mut surfaces = self.surfaces.lock();
        match surfaces.mapped.get_mut(view.slot) {
            Some(count) if *count > 0 && view.device_ptr == Self::device_ptr(view.slot) => {
                *count -= 1;
                self.stats.lock().unmaps += 1;
                Ok(())
            }
            _ => Err(DecodeError::MapFailed {
                slot: view.slot,
                reason: "surface is not mapped".into(),
            }),
        }
    }
}

impl std::fmt::Debug for SyntheticEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticEngine")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
