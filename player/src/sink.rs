//! Frame sinks: where presented passes end up.

use std::io::Write;

use anyhow::{Context, Result};
use vs_common::SurfaceView;

/// Receives every presentation pass while its surface is mapped.
///
/// The view's device pointer is only valid for the duration of the call.
pub trait FrameSink {
    fn present(&mut self, view: &SurfaceView, timestamp: Option<i64>) -> Result<()>;

    /// Called once after the last pass.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Bytes written so far, for sinks that write anything.
    fn bytes_written(&self) -> u64 {
        0
    }
}

/// Counts passes and remembers the newest timestamp. Nothing is read back.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub passes: u64,
    pub second_fields: u64,
    pub last_timestamp: Option<i64>,
}

impl FrameSink for CountingSink {
    fn present(&mut self, view: &SurfaceView, timestamp: Option<i64>) -> Result<()> {
        self.passes += 1;
        if view.field_index > 0 {
            self.second_fields += 1;
        }
        if timestamp.is_some() {
            self.last_timestamp = timestamp;
        }
        Ok(())
    }
}

/// How a dump sink gets pixels out of a mapped surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Readback {
    /// Device-to-host copy through the CUDA driver. The mapping thread
    /// must have the decoder's context current.
    Device,
    /// The surface is not real device memory (synthetic engine): write a
    /// deterministic test pattern of the right geometry instead.
    Pattern,
}

/// Writes every pass as tightly packed NV12 (`width` bytes per row).
pub struct Nv12DumpSink<W: Write> {
    out: W,
    readback: Readback,
    /// Pitched host copy of the mapped surface.
    staging: Vec<u8>,
    passes: u64,
    bytes_written: u64,
}

impl<W: Write> Nv12DumpSink<W> {
    pub fn new(out: W, readback: Readback) -> Self {
        Self {
            out,
            readback,
            staging: Vec::new(),
            passes: 0,
            bytes_written: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn fill_staging(&mut self, view: &SurfaceView) -> Result<()> {
        let size = view.nv12_size();
        self.staging.resize(size, 0);
        match self.readback {
            Readback::Device => {
                // SAFETY: the surface is mapped for the duration of
                // `present` and spans `nv12_size` bytes from the Y plane.
                unsafe {
                    cudarc::driver::result::memcpy_dtoh_sync(&mut self.staging[..], view.device_ptr)
                }
                .with_context(|| format!("Readback of slot {} failed", view.slot))?;
            }
            Readback::Pattern => {
                let pitch = view.pitch as usize;
                let luma = pitch * view.height as usize;
                let (y_plane, uv_plane) = self.staging.split_at_mut(luma);
                let shift = (self.passes & 0xff) as usize;
                for (row, line) in y_plane.chunks_exact_mut(pitch).enumerate() {
                    for (col, px) in line.iter_mut().enumerate() {
                        *px = ((row + col + shift) & 0xff) as u8;
                    }
                }
                uv_plane.fill(128);
            }
        }
        Ok(())
    }
}

impl<W: Write> FrameSink for Nv12DumpSink<W> {
    fn present(&mut self, view: &SurfaceView, _timestamp: Option<i64>) -> Result<()> {
        self.fill_staging(view)?;

        let pitch = view.pitch as usize;
        let width = view.width as usize;
        let rows = view.height as usize + view.height as usize / 2;
        for row in self.staging.chunks_exact(pitch).take(rows) {
            self.out
                .write_all(&row[..width])
                .context("Failed to write NV12 dump")?;
        }
        self.passes += 1;
        self.bytes_written += (width * rows) as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush NV12 dump")
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
