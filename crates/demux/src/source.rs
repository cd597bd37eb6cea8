//! Input selection: container files go to the MP4 demuxer, everything
//! else is read as a raw elementary stream.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::debug;
use vs_common::{DemuxError, Demuxer};

use crate::elementary::ElementaryStreamDemuxer;
use crate::mp4::Mp4Demuxer;
use crate::probe::StreamOverrides;

/// Top-level box types an ISO BMFF file may open with.
const LEADING_BOXES: [&[u8; 4]; 6] = [b"ftyp", b"moov", b"mdat", b"wide", b"free", b"skip"];

/// Whether `head` starts like an MP4/QuickTime file.
pub fn is_iso_bmff(head: &[u8]) -> bool {
    head.len() >= 8 && LEADING_BOXES.iter().any(|kind| &head[4..8] == *kind)
}

/// Open `path` with the demuxer its first bytes call for. A codec given
/// in `overrides` forces the elementary-stream path; the size overrides
/// only apply there.
pub fn open_source(
    path: &Path,
    chunk_size: usize,
    overrides: &StreamOverrides,
) -> Result<Box<dyn Demuxer>, DemuxError> {
    if overrides.codec.is_none() {
        let mut head = Vec::with_capacity(8);
        File::open(path)?.take(8).read_to_end(&mut head)?;
        if is_iso_bmff(&head) {
            debug!(path = %path.display(), "ISO BMFF signature found");
            return Ok(Box::new(Mp4Demuxer::open(path)?));
        }
    }
    Ok(Box::new(ElementaryStreamDemuxer::open(path, chunk_size, overrides)?))
}
