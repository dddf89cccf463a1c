//! gpu-patch host library
//!
//! The host half of the trace protocol: allocating a trace buffer for a
//! launch, draining it while producers run, and turning the drained records
//! and auxiliary structures into a session report.

pub mod analysis;
pub mod config;
pub mod drain;
pub mod metrics;
pub mod output;
pub mod sim;
pub mod sink;

pub use analysis::{AccessSummary, DictionaryReport, SessionReport, ViewLiveness};
pub use config::SessionConfig;
pub use drain::{DrainError, DrainReport, Drainer};
pub use sim::{KernelShape, ProducerStats};
pub use sink::{CollectingSink, FrameSink, NullSink, RecordSink, SummarySink};

use anyhow::{Context, Result};
use gpu_patch_shared::{TorchViewDict, TraceBuffer};
use std::sync::Arc;
use tracing::{info, warn};

/// Launch `shape` against a buffer built from `config`, drain it into
/// `sink`, and analyze the result. `views` > 0 enables TorchView tracking
/// over that many equal slices of the kernel's footprint.
pub async fn run_session<S: RecordSink>(
    config: &SessionConfig,
    shape: &KernelShape,
    views: usize,
    sink: S,
) -> Result<(SessionReport, S)> {
    config.validate().context("Invalid configuration")?;
    shape.validate().context("Invalid kernel shape")?;

    let mut builder = config.buffer_builder(shape.groups)?;
    if views > 0 {
        let torchview = TorchViewDict::new(
            shape.function_pc,
            shape.view_ranges(views)?,
            shape.instructions as usize,
        )
        .context("Failed to allocate TorchView bitmaps")?;
        builder = builder.torchview(torchview);
    }
    let buffer = Arc::new(builder.build().context("Failed to allocate trace buffer")?);

    info!(
        "Launching {} groups x {} accesses on {} workers",
        shape.groups, shape.accesses_per_group, shape.workers
    );
    let producers = shape.launch(Arc::clone(&buffer));

    let mut sink = SummarySink::new(sink);
    let mut drainer = Drainer::new(config);
    let drain = match drainer.run(&buffer, &mut sink).await {
        Ok(report) => report,
        Err(e) => {
            warn!("Drain failed, stopping producers: {}", e);
            if drainer.abandon(&buffer).await {
                for handle in producers {
                    let _ = handle.await;
                }
            }
            return Err(e).context("Trace drain failed");
        }
    };

    let mut stats = ProducerStats::default();
    for handle in producers {
        stats.merge(&handle.await.context("Producer task panicked")?);
    }

    let (sink, accesses) = sink.into_parts();
    let report = SessionReport {
        drain,
        producers: stats,
        accesses,
        dictionary: buffer.address_dict().map(DictionaryReport::from_dict),
        views: buffer
            .torchview()
            .map(analysis::view_liveness)
            .unwrap_or_default(),
    };

    info!(
        "Session complete: {} records drained, {} dropped",
        report.drain.records, report.drain.dropped
    );
    Ok((report, sink))
}
