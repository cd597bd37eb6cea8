//! Raw elementary-stream demuxer.
//!
//! Yields the stream in fixed-size chunks. The hardware parser accepts
//! arbitrary chunk boundaries and finds picture boundaries itself, so no
//! access-unit splitting happens here.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{debug, info};
use vs_common::{DemuxError, Demuxer, Packet, StreamInfo, VideoCodec};

use crate::probe::{detect_codec, probe_elementary, StreamOverrides};

/// Bytes read up front for probing.
const PROBE_SIZE: usize = 256 * 1024;

pub struct ElementaryStreamDemuxer {
    reader: Box<dyn Read + Send>,
    info: StreamInfo,
    /// Probed bytes not yet handed out.
    head: Vec<u8>,
    head_pos: usize,
    chunk_size: usize,
    bytes_read: u64,
    packets: u64,
}

impl ElementaryStreamDemuxer {
    /// Open a raw stream file. The codec comes from the extension unless
    /// overridden.
    pub fn open(
        path: &Path,
        chunk_size: usize,
        overrides: &StreamOverrides,
    ) -> Result<Self, DemuxError> {
        let codec = match overrides.codec {
            Some(codec) => codec,
            None => detect_codec(path)?,
        };
        let file = File::open(path)?;
        let demuxer = Self::from_reader(BufReader::new(file), codec, chunk_size, overrides)?;
        info!(
            path = %path.display(),
            codec = codec.display_name(),
            coded = %demuxer.info.coded,
            "Opened elementary stream"
        );
        Ok(demuxer)
    }

    /// Wrap any reader positioned at the start of the stream.
    pub fn from_reader<R: Read + Send + 'static>(
        mut reader: R,
        codec: VideoCodec,
        chunk_size: usize,
        overrides: &StreamOverrides,
    ) -> Result<Self, DemuxError> {
        let mut head = Vec::with_capacity(PROBE_SIZE);
        (&mut reader)
            .take(PROBE_SIZE as u64)
            .read_to_end(&mut head)?;
        if head.is_empty() {
            return Err(DemuxError::NoVideoTrack);
        }

        let info = probe_elementary(codec, &head, overrides)?;
        Ok(Self {
            reader: Box::new(reader),
            info,
            head,
            head_pos: 0,
            chunk_size: chunk_size.max(1),
            bytes_read: 0,
            packets: 0,
        })
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl Demuxer for ElementaryStreamDemuxer {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        let data = if self.head_pos < self.head.len() {
            let end = (self.head_pos + self.chunk_size).min(self.head.len());
            let chunk = self.head[self.head_pos..end].to_vec();
            self.head_pos = end;
            if self.head_pos == self.head.len() {
                self.head = Vec::new();
                self.head_pos = 0;
            }
            chunk
        } else {
            let mut chunk = Vec::with_capacity(self.chunk_size);
            (&mut self.reader)
                .take(self.chunk_size as u64)
                .read_to_end(&mut chunk)?;
            chunk
        };

        if data.is_empty() {
            debug!(bytes = self.bytes_read, packets = self.packets, "End of elementary stream");
            return Ok(None);
        }

        self.bytes_read += data.len() as u64;
        self.packets += 1;
        let keyframe = self.packets == 1;
        Ok(Some(Packet::new(data, None, keyframe)))
    }
}

impl std::fmt::Debug for ElementaryStreamDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementaryStreamDemuxer")
            .field("codec", &self.info.codec)
            .field("chunk_size", &self.chunk_size)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}
