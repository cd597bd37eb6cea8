//! ISO BMFF box parsing: the moov hierarchy down to the sample tables.
//!
//! Only what packet extraction needs is read: per-track timescale,
//! handler type, the first sample description (geometry and the
//! avcC/hvcC record for video) and the stbl tables.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::{debug, trace};
use vs_common::DemuxError;

// ─── Box FourCC constants ────────────────────────────────────────────

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

pub const FTYP: u32 = fourcc(b"ftyp");
pub const MOOV: u32 = fourcc(b"moov");
pub const TRAK: u32 = fourcc(b"trak");
pub const TKHD: u32 = fourcc(b"tkhd");
pub const MDIA: u32 = fourcc(b"mdia");
pub const MDHD: u32 = fourcc(b"mdhd");
pub const HDLR: u32 = fourcc(b"hdlr");
pub const MINF: u32 = fourcc(b"minf");
pub const STBL: u32 = fourcc(b"stbl");
pub const STSD: u32 = fourcc(b"stsd");
pub const STTS: u32 = fourcc(b"stts");
pub const CTTS: u32 = fourcc(b"ctts");
pub const STSC: u32 = fourcc(b"stsc");
pub const STSZ: u32 = fourcc(b"stsz");
pub const STCO: u32 = fourcc(b"stco");
pub const CO64: u32 = fourcc(b"co64");
pub const STSS: u32 = fourcc(b"stss");
pub const AVCC: u32 = fourcc(b"avcC");
pub const HVCC: u32 = fourcc(b"hvcC");
pub const AVC1: u32 = fourcc(b"avc1");
pub const AVC3: u32 = fourcc(b"avc3");
pub const HVC1: u32 = fourcc(b"hvc1");
pub const HEV1: u32 = fourcc(b"hev1");
pub const MP4V: u32 = fourcc(b"mp4v");
pub const VP09: u32 = fourcc(b"vp09");
pub const AV01: u32 = fourcc(b"av01");
pub const VIDE: u32 = fourcc(b"vide");

/// Upper bound on table entries reserved up front; counts come from the
/// file and are not trusted for allocation.
const MAX_PREALLOC: usize = 1 << 16;

/// Codec configuration records larger than this are rejected.
const MAX_CONFIG_SIZE: u64 = 1 << 20;

/// FourCC as text, for logs and errors.
pub fn fourcc_to_string(cc: u32) -> String {
    cc.to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

fn invalid(offset: u64, reason: impl Into<String>) -> DemuxError {
    DemuxError::InvalidStructure {
        offset,
        reason: reason.into(),
    }
}

// ─── Box header ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct BoxHeader {
    pub box_type: u32,
    /// Total size including the header. 0 means "extends to EOF".
    pub size: u64,
    pub offset: u64,
    /// 8, or 16 with a 64-bit size.
    pub header_size: u8,
}

impl BoxHeader {
    pub fn content_size(&self) -> Option<u64> {
        (self.size != 0).then(|| self.size - self.header_size as u64)
    }

    pub fn end_offset(&self) -> Option<u64> {
        (self.size != 0).then(|| self.offset + self.size)
    }

    fn required_end(&self) -> Result<u64, DemuxError> {
        self.end_offset().ok_or_else(|| {
            invalid(
                self.offset,
                format!("'{}' box has no definite size", fourcc_to_string(self.box_type)),
            )
        })
    }
}

/// Read a box header at the current position. `None` at a clean EOF.
pub fn read_box_header<R: Read + Seek>(reader: &mut R) -> Result<Option<BoxHeader>, DemuxError> {
    let offset = reader.stream_position()?;
    let size32 = match reader.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DemuxError::Io(e)),
    };
    let box_type = reader.read_u32::<BigEndian>()?;

    let (size, header_size) = match size32 {
        0 => (0, 8),
        1 => (reader.read_u64::<BigEndian>()?, 16),
        n => (n as u64, 8),
    };
    if size != 0 && size < header_size as u64 {
        return Err(invalid(
            offset,
            format!("box '{}' has invalid size {}", fourcc_to_string(box_type), size),
        ));
    }

    trace!("Box '{}' at {} size {}", fourcc_to_string(box_type), offset, size);
    Ok(Some(BoxHeader {
        box_type,
        size,
        offset,
        header_size,
    }))
}

/// Seek past the box; boxes without a definite size run to EOF.
pub fn skip_box<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<(), DemuxError> {
    match header.end_offset() {
        Some(end) => reader.seek(SeekFrom::Start(end))?,
        None => reader.seek(SeekFrom::End(0))?,
    };
    Ok(())
}

fn skip_version_and_flags<R: Read>(reader: &mut R) -> Result<u8, DemuxError> {
    let version = reader.read_u8()?;
    let mut flags = [0u8; 3];
    reader.read_exact(&mut flags)?;
    Ok(version)
}

fn read_u32_table<R: Read>(reader: &mut R, count: u32) -> Result<Vec<u32>, DemuxError> {
    let mut values = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        values.push(reader.read_u32::<BigEndian>()?);
    }
    Ok(values)
}

// ─── mdhd / hdlr ────────────────────────────────────────────────────

/// Per-track timescale and duration.
#[derive(Clone, Copy, Debug)]
pub struct MdhdBox {
    pub timescale: u32,
    pub duration: u64,
}

pub fn parse_mdhd<R: Read>(reader: &mut R) -> Result<MdhdBox, DemuxError> {
    let version = skip_version_and_flags(reader)?;
    let (timescale, duration) = if version == 1 {
        let mut times = [0u8; 16];
        reader.read_exact(&mut times)?;
        (reader.read_u32::<BigEndian>()?, reader.read_u64::<BigEndian>()?)
    } else {
        let mut times = [0u8; 8];
        reader.read_exact(&mut times)?;
        (reader.read_u32::<BigEndian>()?, reader.read_u32::<BigEndian>()? as u64)
    };
    debug!("mdhd: timescale={}, duration={}", timescale, duration);
    Ok(MdhdBox {
        timescale,
        duration,
    })
}

/// Handler type of an hdlr box ('vide', 'soun', ...).
pub fn parse_hdlr<R: Read>(reader: &mut R) -> Result<u32, DemuxError> {
    skip_version_and_flags(reader)?;
    let _pre_defined = reader.read_u32::<BigEndian>()?;
    let handler_type = reader.read_u32::<BigEndian>()?;
    debug!("hdlr: handler_type='{}'", fourcc_to_string(handler_type));
    Ok(handler_type)
}

// ─── stsd ───────────────────────────────────────────────────────────

/// First sample entry of a video track.
#[derive(Clone, Debug)]
pub struct VideoSampleDesc {
    pub codec_fourcc: u32,
    pub width: u16,
    pub height: u16,
    /// avcC or hvcC payload, when the entry carries one.
    pub config: Option<Vec<u8>>,
}

/// Parse the first entry of a video track's stsd. Reader must be at the
/// content start.
pub fn parse_video_stsd<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<Option<VideoSampleDesc>, DemuxError> {
    let box_end = header.required_end()?;
    skip_version_and_flags(reader)?;
    let entry_count = reader.read_u32::<BigEndian>()?;

    let mut desc = None;
    if entry_count > 0 {
        if let Some(entry) = read_box_header(reader)? {
            desc = Some(parse_visual_sample_entry(reader, &entry)?);
        }
    }
    if entry_count > 1 {
        debug!("stsd: {} entries, using the first", entry_count);
    }
    reader.seek(SeekFrom::Start(box_end))?;
    Ok(desc)
}

/// VisualSampleEntry: fixed fields, then child boxes (avcC, hvcC, ...).
fn parse_visual_sample_entry<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> Result<VideoSampleDesc, DemuxError> {
    let entry_end = header.required_end()?;

    // reserved (6), data_reference_index (2), pre_defined/reserved (16)
    let mut skip = [0u8; 24];
    reader.read_exact(&mut skip)?;
    let width = reader.read_u16::<BigEndian>()?;
    let height = reader.read_u16::<BigEndian>()?;
    // resolutions, reserved, frame_count, compressorname, depth, pre_defined
    let mut skip = [0u8; 50];
    reader.read_exact(&mut skip)?;

    let mut config = None;
    while reader.stream_position()? < entry_end {
        let Some(child) = read_box_header(reader)? else {
            break;
        };
        if matches!(child.box_type, AVCC | HVCC) {
            let size = child.content_size().unwrap_or(0);
            if size > MAX_CONFIG_SIZE {
                return Err(invalid(child.offset, format!("{size} byte codec configuration")));
            }
            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data)?;
            config = Some(data);
        } else {
            skip_box(reader, &child)?;
        }
    }
    reader.seek(SeekFrom::Start(entry_end))?;

    debug!(
        "Video sample entry '{}': {}x{}, config {:?} bytes",
        fourcc_to_string(header.box_type),
        width,
        height,
        config.as_ref().map(Vec::len)
    );
    Ok(VideoSampleDesc {
        codec_fourcc: header.box_type,
        width,
        height,
        config,
    })
}

// ─── Sample table boxes ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

pub fn parse_stts<R: Read>(reader: &mut R) -> Result<Vec<SttsEntry>, DemuxError> {
    skip_version_and_flags(reader)?;
    let count = reader.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        entries.push(SttsEntry {
            sample_count: reader.read_u32::<BigEndian>()?,
            sample_delta: reader.read_u32::<BigEndian>()?,
        });
    }
    debug!("stts: {} entries", entries.len());
    Ok(entries)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CttsEntry {
    pub sample_count: u32,
    /// Signed in version 1.
    pub sample_offset: i32,
}

pub fn parse_ctts<R: Read>(reader: &mut R) -> Result<Vec<CttsEntry>, DemuxError> {
    let version = skip_version_and_flags(reader)?;
    let count = reader.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        let sample_count = reader.read_u32::<BigEndian>()?;
        let sample_offset = if version == 0 {
            reader.read_u32::<BigEndian>()? as i32
        } else {
            reader.read_i32::<BigEndian>()?
        };
        entries.push(CttsEntry {
            sample_count,
            sample_offset,
        });
    }
    debug!("ctts: {} entries (version {})", entries.len(), version);
    Ok(entries)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StscEntry {
    /// 1-based.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

pub fn parse_stsc<R: Read>(reader: &mut R) -> Result<Vec<StscEntry>, DemuxError> {
    skip_version_and_flags(reader)?;
    let count = reader.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        let first_chunk = reader.read_u32::<BigEndian>()?;
        let samples_per_chunk = reader.read_u32::<BigEndian>()?;
        let _sample_description_index = reader.read_u32::<BigEndian>()?;
        entries.push(StscEntry {
            first_chunk,
            samples_per_chunk,
        });
    }
    debug!("stsc: {} entries", entries.len());
    Ok(entries)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StszBox {
    /// Non-zero when every sample has this size.
    pub default_sample_size: u32,
    /// Per-sample sizes; empty when `default_sample_size` is set.
    pub sample_sizes: Vec<u32>,
    pub sample_count: u32,
}

pub fn parse_stsz<R: Read>(reader: &mut R) -> Result<StszBox, DemuxError> {
    skip_version_and_flags(reader)?;
    let default_sample_size = reader.read_u32::<BigEndian>()?;
    let sample_count = reader.read_u32::<BigEndian>()?;
    let sample_sizes = if default_sample_size == 0 {
        read_u32_table(reader, sample_count)?
    } else {
        Vec::new()
    };
    debug!("stsz: {} samples, default_size={}", sample_count, default_sample_size);
    Ok(StszBox {
        default_sample_size,
        sample_sizes,
        sample_count,
    })
}

/// stco (32-bit) or co64 chunk offsets.
pub fn parse_chunk_offsets<R: Read>(reader: &mut R, wide: bool) -> Result<Vec<u64>, DemuxError> {
    skip_version_and_flags(reader)?;
    let count = reader.read_u32::<BigEndian>()?;
    let mut offsets = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        offsets.push(if wide {
            reader.read_u64::<BigEndian>()?
        } else {
            reader.read_u32::<BigEndian>()? as u64
        });
    }
    debug!("{}: {} chunk offsets", if wide { "co64" } else { "stco" }, offsets.len());
    Ok(offsets)
}

/// 1-based sync sample numbers.
pub fn parse_stss<R: Read>(reader: &mut R) -> Result<Vec<u32>, DemuxError> {
    skip_version_and_flags(reader)?;
    let count = reader.read_u32::<BigEndian>()?;
    let sync = read_u32_table(reader, count)?;
    debug!("stss: {} sync samples", sync.len());
    Ok(sync)
}

// ─── Tracks ─────────────────────────────────────────────────────────

/// One trak box, whatever its media type.
#[derive(Clone, Debug, Default)]
pub struct Mp4Track {
    pub track_id: u32,
    pub handler_type: u32,
    pub timescale: u32,
    pub duration: u64,
    /// Set for video tracks only.
    pub video: Option<VideoSampleDesc>,
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    pub stsz: StszBox,
    pub chunk_offsets: Vec<u64>,
    /// Empty means every sample is a sync sample.
    pub sync_samples: Vec<u32>,
}

impl Mp4Track {
    pub fn is_video(&self) -> bool {
        self.handler_type == VIDE
    }

    fn parse_children<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        container_end: u64,
    ) -> Result<(), DemuxError> {
        while reader.stream_position()? < container_end {
            let Some(child) = read_box_header(reader)? else {
                break;
            };
            match child.box_type {
                MDIA | MINF | STBL => {
                    let end = child.end_offset().unwrap_or(container_end);
                    self.parse_children(reader, end)?;
                }
                TKHD => {
                    let version = skip_version_and_flags(reader)?;
                    // creation and modification times
                    let mut buf = [0u8; 16];
                    let len = if version == 1 { 16 } else { 8 };
                    reader.read_exact(&mut buf[..len])?;
                    self.track_id = reader.read_u32::<BigEndian>()?;
                }
                MDHD => {
                    let mdhd = parse_mdhd(reader)?;
                    self.timescale = mdhd.timescale;
                    self.duration = mdhd.duration;
                }
                HDLR => self.handler_type = parse_hdlr(reader)?,
                // hdlr precedes minf inside mdia.
                STSD if self.is_video() => self.video = parse_video_stsd(reader, &child)?,
                STTS => self.stts = parse_stts(reader)?,
                CTTS => self.ctts = parse_ctts(reader)?,
                STSC => self.stsc = parse_stsc(reader)?,
                STSZ => self.stsz = parse_stsz(reader)?,
                STCO => self.chunk_offsets = parse_chunk_offsets(reader, false)?,
                CO64 => self.chunk_offsets = parse_chunk_offsets(reader, true)?,
                STSS => self.sync_samples = parse_stss(reader)?,
                _ => {}
            }
            skip_box(reader, &child)?;
        }
        Ok(())
    }
}

fn parse_trak<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<Mp4Track, DemuxError> {
    let end = header.required_end()?;
    let mut track = Mp4Track::default();
    track.parse_children(reader, end)?;
    reader.seek(SeekFrom::Start(end))?;
    debug!(
        track_id = track.track_id,
        handler = %fourcc_to_string(track.handler_type),
        samples = track.stsz.sample_count,
        "Parsed trak"
    );
    Ok(track)
}

/// Every trak in the moov box, in file order.
pub fn parse_moov<R: Read + Seek>(
    reader: &mut R,
    moov: &BoxHeader,
) -> Result<Vec<Mp4Track>, DemuxError> {
    let end = moov.required_end()?;
    let mut tracks = Vec::new();
    while reader.stream_position()? < end {
        let Some(child) = read_box_header(reader)? else {
            break;
        };
        if child.box_type == TRAK {
            tracks.push(parse_trak(reader, &child)?);
        } else {
            skip_box(reader, &child)?;
        }
    }
    Ok(tracks)
}

/// Scan top-level boxes from the start of the file for moov.
pub fn find_and_parse_moov<R: Read + Seek>(reader: &mut R) -> Result<Vec<Mp4Track>, DemuxError> {
    reader.seek(SeekFrom::Start(0))?;
    loop {
        let Some(header) = read_box_header(reader)? else {
            return Err(invalid(0, "no moov box found"));
        };
        if header.box_type == MOOV {
            return parse_moov(reader, &header);
        }
        skip_box(reader, &header)?;
    }
}
