//! JSON output
//!
//! Exports a session report in JSON format for further analysis

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use tracing::info;

use crate::analysis::SessionReport;

/// Write `report` as pretty-printed JSON
pub fn write_report(report: &SessionReport, output_path: &str) -> Result<()> {
    info!("Writing session report: {}", output_path);

    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path))?;

    let writer = BufWriter::new(file);

    serde_json::to_writer_pretty(writer, report)
        .context("Failed to serialize session report to JSON")?;

    info!("Session report written to {}", output_path);

    Ok(())
}
