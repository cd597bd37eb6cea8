//! Sample table interpretation: maps sample indices to file byte offsets,
//! sizes, timestamps and sync status.

use vs_common::DemuxError;

use super::boxes::{CttsEntry, Mp4Track, StscEntry, SttsEntry};

/// Tracks declaring more samples than this are treated as corrupt.
const MAX_SAMPLES: usize = 1 << 26;

/// One sample, pre-computed from the stbl tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    pub offset: u64,
    pub size: u32,
    /// Decoding timestamp in track timescale units.
    pub dts: u64,
    /// Composition (presentation) timestamp in track timescale units.
    pub cts: i64,
    pub is_sync: bool,
}

/// Flat list of a track's samples in decode order.
pub fn build_sample_table(track: &Mp4Track) -> Result<Vec<SampleEntry>, DemuxError> {
    let sample_count = track.stsz.sample_count as usize;
    if sample_count == 0 {
        return Ok(Vec::new());
    }
    if sample_count > MAX_SAMPLES {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: format!("track declares {sample_count} samples"),
        });
    }

    let offsets = build_sample_offsets(track, sample_count)?;
    let dts = build_dts_array(&track.stts, sample_count);
    let cts_offsets = build_cts_offsets(&track.ctts, sample_count);

    let samples = offsets
        .into_iter()
        .zip(dts)
        .zip(cts_offsets)
        .enumerate()
        .map(|(i, (((offset, size), dts), cts_offset))| SampleEntry {
            offset,
            size,
            dts,
            cts: dts as i64 + cts_offset as i64,
            is_sync: track.sync_samples.is_empty()
                || track.sync_samples.binary_search(&(i as u32 + 1)).is_ok(),
        })
        .collect();
    Ok(samples)
}

/// (offset, size) per sample from stsc + stco/co64 + stsz.
fn build_sample_offsets(
    track: &Mp4Track,
    sample_count: usize,
) -> Result<Vec<(u64, u32)>, DemuxError> {
    let stsz = &track.stsz;
    if stsz.default_sample_size == 0 && stsz.sample_sizes.len() < sample_count {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: format!(
                "stsz lists {} sizes for {} samples",
                stsz.sample_sizes.len(),
                sample_count
            ),
        });
    }

    let mut result = Vec::with_capacity(sample_count);
    'chunks: for (chunk_idx, &chunk_offset) in track.chunk_offsets.iter().enumerate() {
        let samples_in_chunk = samples_per_chunk_for(&track.stsc, chunk_idx as u32 + 1);
        let mut offset = chunk_offset;
        for _ in 0..samples_in_chunk {
            let index = result.len();
            if index >= sample_count {
                break 'chunks;
            }
            let size = if stsz.default_sample_size > 0 {
                stsz.default_sample_size
            } else {
                stsz.sample_sizes[index]
            };
            result.push((offset, size));
            offset = offset.saturating_add(size as u64);
        }
    }

    if result.len() != sample_count {
        return Err(DemuxError::InvalidStructure {
            offset: 0,
            reason: format!(
                "chunks hold {} samples but stsz declares {} (stsc/stco/stsz mismatch)",
                result.len(),
                sample_count
            ),
        });
    }
    Ok(result)
}

/// Samples in the given 1-based chunk: the last stsc entry whose
/// first_chunk is not past it applies.
fn samples_per_chunk_for(stsc: &[StscEntry], chunk_num: u32) -> u32 {
    stsc.iter()
        .take_while(|entry| entry.first_chunk <= chunk_num)
        .last()
        .map_or(1, |entry| entry.samples_per_chunk)
}

/// DTS per sample; samples stts does not cover continue with its last delta.
fn build_dts_array(stts: &[SttsEntry], sample_count: usize) -> Vec<u64> {
    let mut dts_array = Vec::with_capacity(sample_count);
    let mut dts: u64 = 0;
    for entry in stts {
        for _ in 0..entry.sample_count {
            if dts_array.len() >= sample_count {
                return dts_array;
            }
            dts_array.push(dts);
            dts += entry.sample_delta as u64;
        }
    }
    let last_delta = stts.last().map_or(1, |e| e.sample_delta as u64);
    while dts_array.len() < sample_count {
        dts_array.push(dts);
        dts += last_delta;
    }
    dts_array
}

/// Composition offset per sample, 0 past the end of ctts.
fn build_cts_offsets(ctts: &[CttsEntry], sample_count: usize) -> Vec<i32> {
    let mut offsets: Vec<i32> = ctts
        .iter()
        .flat_map(|entry| std::iter::repeat(entry.sample_offset).take(entry.sample_count as usize))
        .take(sample_count)
        .collect();
    offsets.resize(sample_count, 0);
    offsets
}
