//! Mapped views of decode surfaces.
//!
//! Consumers never own a surface. They map one presentation pass, read
//! through the returned [`SurfaceView`], and unmap. [`MappedSurface`] is the
//! RAII form of that contract: the pass is unmapped on drop.

use std::fmt;
use std::ops::Deref;

use tracing::error;

use crate::error::DecodeError;
use crate::traits::DecodeEngine;

/// One presentation pass over a decoded surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldPass {
    /// Pass number within the entry (0-based). Also the field selector for
    /// interlaced content.
    pub index: u32,
    /// Total passes for the entry (1, 2 or 3).
    pub count: u32,
    pub progressive: bool,
    pub top_field_first: bool,
}

impl FieldPass {
    /// Single pass over a progressive frame.
    pub const FRAME: Self = Self {
        index: 0,
        count: 1,
        progressive: true,
        top_field_first: false,
    };

    /// Whether this pass processes the second field of the pair.
    pub fn second_field(&self) -> bool {
        self.index > 0
    }

    /// A single-pass entry has no partner field.
    pub fn unpaired(&self) -> bool {
        self.count == 1
    }
}

/// Read view of one mapped surface pass.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SurfaceView {
    pub slot: usize,
    /// Device pointer to the NV12 Y plane.
    pub device_ptr: u64,
    /// Row pitch in bytes.
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub progressive: bool,
    pub field_index: u32,
}

impl SurfaceView {
    /// Device pointer to the interleaved UV plane.
    pub fn uv_device_ptr(&self) -> u64 {
        self.device_ptr + self.height as u64 * self.pitch as u64
    }

    /// NV12 byte size of the mapped pass.
    pub fn nv12_size(&self) -> usize {
        let y = self.pitch as usize * self.height as usize;
        y + y / 2
    }
}

impl fmt::Debug for SurfaceView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceView")
            .field("slot", &self.slot)
            .field("device_ptr", &format_args!("0x{:x}", self.device_ptr))
            .field("pitch", &self.pitch)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("progressive", &self.progressive)
            .field("field_index", &self.field_index)
            .finish()
    }
}

/// A mapped surface pass that unmaps itself on drop.
///
/// The device pointer is only valid while this guard is alive.
pub struct MappedSurface<'e> {
    engine: &'e dyn DecodeEngine,
    view: SurfaceView,
    unmapped: bool,
}

impl<'e> MappedSurface<'e> {
    pub fn map(
        engine: &'e dyn DecodeEngine,
        slot: usize,
        pass: FieldPass,
    ) -> Result<Self, DecodeError> {
        let view = engine.map_surface(slot, pass)?;
        Ok(Self {
            engine,
            view,
            unmapped: false,
        })
    }

    pub fn view(&self) -> &SurfaceView {
        &self.view
    }

    /// Unmap now and report failure instead of logging it.
    pub fn unmap(mut self) -> Result<(), DecodeError> {
        self.unmapped = true;
        self.engine.unmap_surface(&self.view)
    }
}

impl Deref for MappedSurface<'_> {
    type Target = SurfaceView;

    fn deref(&self) -> &SurfaceView {
        &self.view
    }
}

impl fmt::Debug for MappedSurface<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedSurface")
            .field("engine", &self.engine.name())
            .field("view", &self.view)
            .finish()
    }
}

impl Drop for MappedSurface<'_> {
    fn drop(&mut self) {
        if self.unmapped {
            return;
        }
        if let Err(e) = self.engine.unmap_surface(&self.view) {
            error!(
                slot = self.view.slot,
                dev_ptr = format_args!("0x{:x}", self.view.device_ptr),
                "Failed to unmap surface in Drop: {e}"
            );
        }
    }
}
