//! Destinations for drained batches

use anyhow::{Context, Result};
use gpu_patch_shared::protocol::wire::{write_frame, TraceBatch};
use std::io::Write;

use crate::analysis::AccessSummary;

/// Receives every non-empty drain, in sequence order.
pub trait RecordSink {
    fn accept(&mut self, batch: &TraceBatch) -> Result<()>;

    /// Called once after the final drain.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every batch in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub batches: Vec<TraceBatch>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|b| b.records.len()).sum()
    }
}

impl RecordSink for CollectingSink {
    fn accept(&mut self, batch: &TraceBatch) -> Result<()> {
        self.batches.push(batch.clone());
        Ok(())
    }
}

/// Discards every batch; pair with [`SummarySink`] when only totals matter
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn accept(&mut self, _batch: &TraceBatch) -> Result<()> {
        Ok(())
    }
}

/// Streams batches as length-prefixed wire frames
#[derive(Debug)]
pub struct FrameSink<W: Write> {
    writer: W,
    frames: u64,
}

impl<W: Write> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for FrameSink<W> {
    fn accept(&mut self, batch: &TraceBatch) -> Result<()> {
        write_frame(&mut self.writer, batch)
            .with_context(|| format!("Failed to write frame for batch {}", batch.sequence))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush trace frames")
    }
}

/// Folds every batch into an [`AccessSummary`] before forwarding it
#[derive(Debug)]
pub struct SummarySink<S> {
    inner: S,
    summary: AccessSummary,
}

impl<S: RecordSink> SummarySink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            summary: AccessSummary::default(),
        }
    }

    pub fn summary(&self) -> &AccessSummary {
        &self.summary
    }

    pub fn into_parts(self) -> (S, AccessSummary) {
        (self.inner, self.summary)
    }
}

impl<S: RecordSink> RecordSink for SummarySink<S> {
    fn accept(&mut self, batch: &TraceBatch) -> Result<()> {
        self.inner.accept(batch)?;
        self.summary.add(&batch.records);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}
