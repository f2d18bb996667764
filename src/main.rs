//! CLI Entry Point for detstream
//!
//! Provides command-line interface for:
//! - Persisting a detector stream to HDF5 (foreground)
//! - Summing a fixed number of frames into one image (foreground)
//! - Inspecting a frame store
//! - Publishing synthetic frames from a mock detector
//! - Running as a worker process under a controller
//!
//! # Usage
//!
//! ```bash
//! detstream --config config/detstream.toml persist --output run_0001.h5
//! detstream accumulate --count 20
//! detstream inspect run_0001.h5
//! detstream mock-detector --bind tcp://*:5501 --compression bslz4
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use detstream::codec::message::WireCompression;
use detstream::config::{Protocol, StreamConfig};
use detstream::data::status::SharedStatus;
use detstream::logging;
use detstream::mock::{FrameGenerator, MockDetector};
use detstream::worker::{self, WorkerKind};

#[derive(Parser)]
#[command(name = "detstream")]
#[command(about = "Detector frame streaming, persistence and accumulation", long_about = None)]
struct Cli {
    /// Configuration file (missing files fall back to defaults + DETSTREAM_ variables)
    #[arg(long, global = true, default_value = "detstream.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write every received frame to an HDF5 store until Ctrl-C
    Persist {
        /// Output file (overrides [store] output)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Sum a fixed number of frames into one image
    Accumulate {
        /// Frames to sum (overrides [accumulator] count)
        #[arg(long)]
        count: Option<usize>,

        /// Output file (overrides [accumulator] output)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the contents of a frame store
    Inspect {
        /// Store to read
        file: PathBuf,

        /// Start reading at this frame index
        #[arg(long, default_value_t = 0)]
        start: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Publish synthetic frames
    MockDetector {
        /// Endpoint to bind
        #[arg(long, default_value = "tcp://*:5501")]
        bind: String,

        #[arg(long, value_enum, default_value_t = ProtocolArg::Cbor)]
        protocol: ProtocolArg,

        #[arg(long, value_enum, default_value_t = CompressionArg::None)]
        compression: CompressionArg,

        /// Frames to publish
        #[arg(long, default_value_t = 100)]
        count: u64,

        /// Delay between frames in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },

    /// Worker process entry (spawned by a controller)
    #[command(hide = true)]
    Worker {
        #[arg(value_enum)]
        kind: KindArg,

        /// Status block created by the controller
        #[arg(long)]
        status: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Legacy,
    Cbor,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Legacy => Protocol::Legacy,
            ProtocolArg::Cbor => Protocol::Cbor,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Lz4,
    Bslz4,
}

impl From<CompressionArg> for WireCompression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => WireCompression::None,
            CompressionArg::Lz4 => WireCompression::Lz4,
            CompressionArg::Bslz4 => WireCompression::Bslz4,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Persist,
    Accumulate,
}

impl From<KindArg> for WorkerKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Persist => WorkerKind::Persist,
            KindArg::Accumulate => WorkerKind::Accumulate,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Worker { kind, status } = &cli.command {
        let code = run_worker((*kind).into(), &cli.config, status)?;
        std::process::exit(code);
    }

    let config = load_config(&cli.config)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Persist { output } => persist(config, output).await,
        Commands::Accumulate { count, output } => accumulate(config, count, output).await,
        Commands::Inspect { file, start, json } => inspect(file, start, json),
        Commands::MockDetector {
            bind,
            protocol,
            compression,
            count,
            interval_ms,
        } => mock_detector(config, bind, protocol.into(), compression.into(), count, interval_ms).await,
        Commands::Worker { .. } => Ok(()),
    }
}

fn load_config(path: &std::path::Path) -> Result<StreamConfig> {
    let config = StreamConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn run_worker(kind: WorkerKind, config_path: &std::path::Path, status: &std::path::Path) -> Result<i32> {
    // logging comes from the worker's own config; fall back to defaults if it is unreadable
    let log_config = StreamConfig::load_from(config_path).unwrap_or_default();
    if let Err(e) = logging::init_from_config(&log_config) {
        eprintln!("{e}");
    }
    info!(%kind, pid = std::process::id(), "Worker starting");
    Ok(worker::serve(kind, config_path, status)?)
}

/// Run a blocking worker body with Ctrl-C wired to the stop flag.
async fn with_ctrl_c<T, F>(body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<SharedStatus>) -> T + Send + 'static,
{
    let status = Arc::new(SharedStatus::anonymous()?);
    let signal_status = status.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            signal_status.request_stop();
        }
    });

    Ok(tokio::task::spawn_blocking(move || body(status)).await?)
}

async fn persist(mut config: StreamConfig, output: Option<PathBuf>) -> Result<()> {
    if let Some(output) = output {
        config.store.output = output;
    }
    info!(endpoint = %config.transport.endpoint, output = %config.store.output.display(), "Persisting stream");

    let summary = with_ctrl_c(move |status| worker::run_persist(&config, status)).await??;
    println!(
        "frames written: {}  decode failures: {}  frames skipped: {}",
        summary.status.frames_written, summary.status.decode_failures, summary.status.frames_skipped
    );
    if let (Some(first), Some(last)) = (summary.status.first_frame_id, summary.status.last_frame_id) {
        println!("frame ids: {first}..={last}");
    }
    Ok(())
}

async fn accumulate(mut config: StreamConfig, count: Option<usize>, output: Option<PathBuf>) -> Result<()> {
    if let Some(count) = count {
        config.accumulator.count = count;
    }
    if let Some(output) = output {
        config.accumulator.output = output;
    }
    config.validate()?;
    let output = config.accumulator.output.clone();

    let result = with_ctrl_c(move |status| worker::run_accumulate(&config, status)).await??;
    println!(
        "summed {} frames ({:?}) into {}",
        result.frames,
        result.outcome,
        output.display()
    );
    Ok(())
}

/// What `inspect` reports about a store.
#[cfg(feature = "storage_hdf5")]
#[derive(Debug, serde::Serialize)]
struct StoreSummary {
    path: PathBuf,
    frames: usize,
    rows: usize,
    cols: usize,
    dtype: String,
    start: usize,
    first_id: Option<i64>,
    last_id: Option<i64>,
}

#[cfg(feature = "storage_hdf5")]
fn inspect(file: PathBuf, start: usize, json: bool) -> Result<()> {
    use detstream::data::hdf5_store::FrameStore;
    use detstream::StreamError;

    let mut store = FrameStore::open_read(&file).with_context(|| format!("Failed to open {}", file.display()))?;
    store.seek(start)?;
    let (mut first_id, mut last_id) = (None, None);
    loop {
        match store.read() {
            Ok(frame) => {
                first_id.get_or_insert(frame.frame_id);
                last_id = Some(frame.frame_id);
            }
            Err(StreamError::EndOfStore) => break,
            Err(e) => return Err(e.into()),
        }
    }
    info!(cursor = store.tell(), "Reached end of store");

    let (rows, cols) = store.shape();
    let summary = StoreSummary {
        path: file,
        frames: store.n_frames(),
        rows,
        cols,
        dtype: store.dtype().to_string(),
        start,
        first_id,
        last_id,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("{}", summary.path.display());
    println!("  frames: {}", summary.frames);
    println!("  shape:  {rows} x {cols}");
    println!("  dtype:  {}", summary.dtype);
    if let (Some(first), Some(last)) = (first_id, last_id) {
        println!("  ids:    {first}..={last} (from index {start})");
    }
    Ok(())
}

#[cfg(not(feature = "storage_hdf5"))]
fn inspect(_file: PathBuf, _start: usize, _json: bool) -> Result<()> {
    Err(detstream::StreamError::FeatureNotEnabled("storage_hdf5".into()).into())
}

async fn mock_detector(
    config: StreamConfig,
    bind: String,
    protocol: Protocol,
    compression: WireCompression,
    count: u64,
    interval_ms: u64,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let signal_flag = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_flag.store(false, Ordering::SeqCst);
        }
    });

    let sent = tokio::task::spawn_blocking(move || -> Result<u64> {
        let detector = MockDetector::bind(&bind, protocol, compression)?;
        info!(endpoint = %detector.endpoint()?, ?protocol, ?compression, "Mock detector bound");
        // give subscribers a moment to connect before the series header goes out
        std::thread::sleep(Duration::from_millis(500));

        let mut generator = FrameGenerator::new(config.frame, rand::random());
        let sent = detector.publish_series(&mut generator, 1, count, Duration::from_millis(interval_ms), || {
            running.load(Ordering::SeqCst)
        })?;
        Ok(sent)
    })
    .await??;

    if sent < count {
        warn!(sent, count, "Interrupted");
    }
    println!("published {sent} frames");
    Ok(())
}
