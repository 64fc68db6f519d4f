//! Chuff audio server - CLI binary.
//!
//! Wires the three pipeline stages together: URTP ingest, the audio
//! processor and the HLS publisher.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};

use chuff_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use chuff_server::publisher::{clear_stale_segments, Publisher, PublisherConfig};
use chuff_server::{ingest, processor, SegmentWriter};

/// Capacity of the frame channel into the processor; ingest blocks
/// when the processor falls this far behind (about two seconds).
const FRAME_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the media-control channel into the publisher.
const MEDIA_CHANNEL_CAPACITY: usize = 16;

/// Chuff audio server - receive URTP audio, stream it out as HLS
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Port to listen on for incoming URTP audio
    input_port: u16,

    /// Port to serve the HLS stream on (HTTPS)
    output_port: u16,

    /// Playlist file path; segment files are written to its directory
    playlist_path: PathBuf,

    /// Receive the audio as a single TCP stream instead of UDP datagrams
    #[arg(short, long)]
    tcp: bool,

    /// Delete pre-existing segment files from the playlist directory
    #[arg(short = 'c', long)]
    clear: bool,

    /// Directory to redirect to while no live audio is available
    #[arg(short = 'o', long = "out-of-service")]
    out_of_service_dir: Option<String>,

    /// File for logging output (will be truncated if it already exists)
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// File for a raw 16-bit PCM mirror of the decoded audio
    #[arg(short = 'r', long)]
    raw_pcm_file: Option<PathBuf>,

    /// Bind address for a Prometheus scrape endpoint, e.g. 127.0.0.1:9100
    #[arg(long)]
    metrics: Option<SocketAddr>,

    /// When to use ANSI colors on the console
    #[arg(long, default_value = "auto")]
    color: ColorWhen,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color, args.log_file.as_deref())?;

    info!("starting the Chuff audio server");
    info!("audio in on port {} ({})", args.input_port, if args.tcp { "TCP" } else { "UDP" });
    info!(
        "stream out on port {}, playlist {}",
        args.output_port,
        args.playlist_path.display()
    );

    let metrics = MetricsContext::new("server").context("failed to set up metrics")?;
    if let Some(bind) = args.metrics {
        metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
        info!("metrics endpoint on {}", bind);
    }

    if args.clear {
        clear_stale_segments(&args.playlist_path)?;
    }

    // Anything that must fail fast does so here, before the tasks start.
    let writer = SegmentWriter::new(chuff_server::segment::segment_dir(&args.playlist_path))
        .context("failed to set up the MP3 encoder")?;

    let raw_pcm = match &args.raw_pcm_file {
        Some(path) => {
            info!("mirroring raw PCM to {}", path.display());
            Some(
                std::fs::File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            )
        }
        None => None,
    };

    let publisher = Publisher::new(
        PublisherConfig {
            port: args.output_port,
            playlist_path: args.playlist_path.clone(),
            out_of_service_dir: args.out_of_service_dir.clone(),
        },
        metrics.clone(),
    )?;

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (media_tx, media_rx) = mpsc::channel(MEDIA_CHANNEL_CAPACITY);

    let mut processor_task = tokio::spawn(processor::run_processor(
        frame_rx,
        media_tx,
        writer,
        raw_pcm,
        metrics.clone(),
    ));

    let mut ingest_task = if args.tcp {
        tokio::spawn(ingest::run_tcp(args.input_port, frame_tx, metrics.clone()))
    } else {
        tokio::spawn(ingest::run_udp(args.input_port, frame_tx, metrics.clone()))
    };

    let mut publisher_task = tokio::spawn(publisher.run(media_rx));

    // The tasks run until failure or ctrl-c.
    tokio::select! {
        joined = &mut ingest_task => {
            error!("ingest stopped unexpectedly");
            joined.context("ingest task panicked")?
        }
        joined = &mut processor_task => {
            error!("audio processing stopped unexpectedly");
            joined.context("processor task panicked")?
        }
        joined = &mut publisher_task => {
            error!("publisher stopped unexpectedly");
            joined.context("publisher task panicked")?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
