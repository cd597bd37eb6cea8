//! vidsync: decode a video stream (raw elementary stream or MP4) through
//! the frame synchronizer and present every picture in display order.
//!
//! The NVDEC engine is used when an NVIDIA driver is present; otherwise
//! (or with `--synthetic`) the software stand-in drives the same pipeline.

mod render;
mod sink;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vs_common::{DecodeEngine, SessionConfig, VideoCodec};
use vs_decoder::{nvdec, NvDecEngine, SyntheticConfig, SyntheticEngine};
use vs_demux::{filter_for_stream, open_source, StreamOverrides};
use vs_framesync::{DriverReport, Session, SyncStats};

use render::RenderStats;
use sink::{CountingSink, FrameSink, Nv12DumpSink, Readback};

/// vidsync - hardware decode with in-order frame presentation
#[derive(Parser, Debug)]
#[command(name = "vidsync")]
#[command(about = "Decode a video stream and present frames in display order")]
#[command(version)]
struct Args {
    /// MP4/MOV file, or raw elementary stream (.h264, .264, .avc, .h265,
    /// .hevc, .265)
    input: PathBuf,

    /// JSON session configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of decode surfaces
    #[arg(long)]
    surfaces: Option<usize>,

    /// Parser display delay (pictures held back for reordering)
    #[arg(long)]
    display_delay: Option<u32>,

    /// Coded width, required for raw streams whose headers are not probed
    #[arg(long)]
    width: Option<u32>,

    /// Coded height, required for raw streams whose headers are not probed
    #[arg(long)]
    height: Option<u32>,

    /// Luma bit depth for raw streams whose headers are not probed
    #[arg(long)]
    bit_depth: Option<u8>,

    /// CUDA device ordinal
    #[arg(long, default_value = "0")]
    device: usize,

    /// Use the software engine instead of NVDEC
    #[arg(long)]
    synthetic: bool,

    /// Write every presented pass as raw NV12 to this file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Print the final statistics as JSON
    #[arg(long)]
    stats_json: bool,

    /// Stop after presenting this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Final report printed at exit.
#[derive(Debug, Serialize)]
struct PlayerStats {
    engine: String,
    /// Pictures decoded into surfaces.
    decoded: u64,
    /// Display entries presented.
    frames: u64,
    /// Mapped passes, field repeats included.
    presented_passes: u64,
    repeated_passes: u64,
    elapsed_secs: f64,
    fps: f64,
    truncated: bool,
    dump_bytes: u64,
    sync: SyncStats,
    driver: Option<DriverReport>,
}

impl PlayerStats {
    fn new(
        engine: &str,
        render: &RenderStats,
        sync: SyncStats,
        driver: Option<DriverReport>,
        dump_bytes: u64,
    ) -> Self {
        Self {
            engine: engine.to_string(),
            decoded: sync.decoded,
            frames: render.entries,
            presented_passes: render.passes,
            repeated_passes: render.repeated,
            elapsed_secs: render.elapsed.as_secs_f64(),
            fps: render.fps(),
            truncated: render.truncated,
            dump_bytes,
            sync,
            driver,
        }
    }

    fn print(&self) {
        println!();
        println!("Engine:    {}", self.engine);
        println!("Decoded:   {} frames", self.decoded);
        println!(
            "Presented: {} frames, {} passes ({} repeated)",
            self.frames, self.presented_passes, self.repeated_passes
        );
        println!("Elapsed:   {:.3}s ({:.1} fps)", self.elapsed_secs, self.fps);
        if self.dump_bytes > 0 {
            println!("Dumped:    {} bytes", self.dump_bytes);
        }
        if let Some(driver) = &self.driver {
            println!(
                "Source:    {} packets fed, {} skipped, {:?}",
                driver.packets_fed, driver.packets_skipped, driver.outcome
            );
        }
        if self.truncated {
            println!("(stopped at --max-frames)");
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(&args)?;
    info!(
        surfaces = config.surfaces(),
        display_delay = config.max_display_delay,
        "vidsync {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let overrides = StreamOverrides {
        width: args.width,
        height: args.height,
        bit_depth: args.bit_depth,
        ..StreamOverrides::default()
    };
    let demuxer = open_source(&args.input, config.read_chunk_size, &overrides)
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    let info = demuxer.stream_info().clone();
    let bitstream_filter = filter_for_stream(&info).context("Invalid codec configuration")?;

    let (engine, readback) = select_engine(&args, &config, info.codec);
    let engine_name = engine.name().to_string();

    let session = Session::open(engine, demuxer, bitstream_filter, config)
        .context("Failed to configure decode session")?;
    session.start().context("Failed to start source driver")?;

    let (render_stats, dump_bytes) = match &args.dump {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut sink = Nv12DumpSink::new(BufWriter::new(file), readback);
            let stats = render::render(&session, &mut sink, args.max_frames)?;
            (stats, sink.bytes_written())
        }
        None => {
            let mut sink = CountingSink::default();
            let stats = render::render(&session, &mut sink, args.max_frames)?;
            (stats, sink.bytes_written())
        }
    };

    session.stop();
    let stats = PlayerStats::new(
        &engine_name,
        &render_stats,
        session.stats(),
        session.driver_report(),
        dump_bytes,
    );
    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        stats.print();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(surfaces) = args.surfaces {
        config.num_surfaces = surfaces;
    }
    if let Some(delay) = args.display_delay {
        config.max_display_delay = delay;
    }
    Ok(config)
}

/// NVDEC when available and able to decode `codec`, else the synthetic engine.
fn select_engine(
    args: &Args,
    config: &SessionConfig,
    codec: VideoCodec,
) -> (Arc<dyn DecodeEngine>, Readback) {
    if !args.synthetic {
        if !nvdec::supports(codec) {
            warn!(codec = codec.display_name(), "NVDEC cannot decode this codec, using synthetic engine");
        } else {
            match NvDecEngine::new(args.device, config) {
                Ok(engine) => {
                    info!(gpu = engine.gpu_name(), "Using NVDEC");
                    return (Arc::new(engine), Readback::Device);
                }
                Err(e) => warn!("NVDEC unavailable ({e}), using synthetic engine"),
            }
        }
    }
    let engine = SyntheticEngine::new(SyntheticConfig::from_session(config));
    (Arc::new(engine), Readback::Pattern)
}
