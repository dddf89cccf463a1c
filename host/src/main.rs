//! gpu-patch launch simulator
//!
//! Runs a synthetic instrumented kernel against a shared trace buffer,
//! drains it the way a profiler host would, and reports what was captured.

use anyhow::{Context, Result};
use clap::Parser;
use gpu_patch_host::{output, run_session, FrameSink, KernelShape, NullSink, SessionConfig};
use gpu_patch_shared::utils::{parse_address, parse_duration};
use gpu_patch_shared::RecordType;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gpu-patch-sim")]
#[command(about = "Simulate an instrumented GPU kernel and drain its memory trace", long_about = None)]
#[command(version)]
struct Args {
    /// Session config file (TOML, YAML or JSON); GPU_PATCH_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Producer groups (warps) to launch
    #[arg(short, long, default_value = "64")]
    groups: u32,

    /// Memory instructions per group
    #[arg(short, long, default_value = "32")]
    accesses: u32,

    /// Blocks the groups are spread over
    #[arg(long, default_value = "8")]
    blocks: u32,

    /// Producer worker threads
    #[arg(short, long, default_value = "4")]
    workers: u32,

    /// Base address of the simulated allocation (hex or decimal)
    #[arg(long, default_value = "0x10000000")]
    base: String,

    /// Bytes of the allocation accesses cycle through
    #[arg(long, default_value = "65536")]
    footprint: u64,

    /// Distinct instructions in the simulated function
    #[arg(long, default_value = "64")]
    instructions: u32,

    /// Emit block enter/exit markers
    #[arg(long)]
    block_markers: bool,

    /// Record type: full, address or analysis (overrides config)
    #[arg(short = 't', long)]
    record_type: Option<RecordType>,

    /// Buffer capacity in records (overrides config)
    #[arg(long)]
    capacity: Option<u32>,

    /// Give up after producers stall for this long, e.g. "30s" (overrides config)
    #[arg(long)]
    stall_timeout: Option<String>,

    /// Track this many TorchView ranges over the footprint
    #[arg(long, default_value = "0")]
    views: usize,

    /// Write the session report as JSON
    #[arg(short, long)]
    output: Option<String>,

    /// Write drained batches as length-prefixed frames
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    init_tracing(args.verbose)?;

    info!("Starting gpu-patch launch simulator");

    let mut config = SessionConfig::load(args.config.as_deref())?;
    if let Some(record_type) = args.record_type {
        config.record_type = record_type;
    }
    if let Some(capacity) = args.capacity {
        config.buffer_records = capacity;
    }
    if let Some(timeout) = &args.stall_timeout {
        config.stall_timeout_ms = parse_duration(timeout)
            .context("Failed to parse stall timeout")?
            .as_millis() as u64;
    }

    let shape = KernelShape {
        groups: args.groups,
        accesses_per_group: args.accesses,
        blocks: args.blocks,
        base_address: parse_address(&args.base).context("Failed to parse base address")?,
        footprint: args.footprint,
        instructions: args.instructions,
        workers: args.workers,
        block_markers: args.block_markers,
        ..KernelShape::default()
    };
    info!("Configuration: {:?}", config);

    let report = match &args.frames {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create frame file: {}", path.display()))?;
            let sink = FrameSink::new(BufWriter::new(file));
            let (report, sink) = run_session(&config, &shape, args.views, sink).await?;
            info!("Wrote {} frames to {}", sink.frames(), path.display());
            report
        }
        None => run_session(&config, &shape, args.views, NullSink).await?.0,
    };

    info!(
        "{} records ({} reads, {} writes) from {} distinct instructions",
        report.accesses.records,
        report.accesses.reads,
        report.accesses.writes,
        report.accesses.per_pc.len()
    );
    if let Some(dict) = &report.dictionary {
        info!(
            "Address dictionary: {} ranges, {} overflowed",
            dict.entries.len(),
            dict.overflowed
        );
    }
    for view in report.views.iter().filter(|v| v.is_dead()) {
        info!("View {} ({:#x}..{:#x}) was never touched", view.range_index, view.range.start, view.range.end);
    }

    if let Some(path) = &args.output {
        output::json::write_report(&report, path)?;
    }

    if args.metrics {
        print!("{}", gpu_patch_host::metrics::encode_metrics());
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}
