//! Host drain loop
//!
//! Polls a [`TraceBuffer`] while producers run, shipping every non-empty
//! drain to a [`RecordSink`]. Idle polls back off exponentially; a poll that
//! finds records resets the interval, and a full buffer is drained again
//! without sleeping. The loop ends with a final drain once every producer
//! group has finished, or with [`DrainError::Stalled`] when live producers
//! make no progress for the configured timeout.

use gpu_patch_shared::protocol::wire::TraceBatch;
use gpu_patch_shared::utils::time::system_time_nanos;
use gpu_patch_shared::TraceBuffer;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::metrics;
use crate::sink::RecordSink;

const SINK_RETRY_DELAY: Duration = Duration::from_millis(10);
const SINK_RETRY_DELAY_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("no progress for {waited:?} with {live_threads} producer groups still live")]
    Stalled { live_threads: u32, waited: Duration },

    #[error("sink rejected batch {sequence}: {cause:#}")]
    Sink { sequence: u64, cause: anyhow::Error },
}

/// What one drain session moved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub records: u64,
    pub batches: u64,
    pub polls: u64,
    /// Records producers dropped after stalling on a full buffer
    pub dropped: u64,
}

#[derive(Debug)]
pub struct Drainer {
    poll_interval: Duration,
    max_poll_interval: Duration,
    stall_timeout: Duration,
    sink_attempts: u32,
    next_sequence: u64,
}

impl Drainer {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_poll_interval: config.max_poll_interval(),
            stall_timeout: config.stall_timeout(),
            sink_attempts: config.sink_attempts.max(1),
            next_sequence: 1,
        }
    }

    /// Drain `buffer` into `sink` until every producer group has finished.
    pub async fn run<S: RecordSink>(
        &mut self,
        buffer: &TraceBuffer,
        sink: &mut S,
    ) -> Result<DrainReport, DrainError> {
        let mut report = DrainReport::default();
        let mut interval = self.poll_interval;
        let mut last_progress = Instant::now();

        info!(
            "Draining {:?} buffer of {} records ({} producer groups)",
            buffer.record_type(),
            buffer.capacity(),
            buffer.live_threads()
        );

        loop {
            // Read completion before draining: records published before the
            // last group finished are then guaranteed to be visible below.
            let complete = buffer.is_complete();
            report.polls += 1;
            metrics::BUFFER_UTILIZATION.set(buffer.pending() as f64 / buffer.capacity() as f64);

            let drained = self.drain_once(buffer, sink, &mut report).await?;

            if complete {
                while self.drain_once(buffer, sink, &mut report).await? > 0 {}
                sink.finish().map_err(|cause| DrainError::Sink {
                    sequence: self.next_sequence,
                    cause,
                })?;
                return Ok(self.finish(buffer, report));
            }

            if drained > 0 {
                interval = self.poll_interval;
                last_progress = Instant::now();
            } else {
                let waited = last_progress.elapsed();
                if waited >= self.stall_timeout {
                    let live_threads = buffer.live_threads();
                    metrics::DRAIN_STALLS.inc();
                    warn!(
                        "Giving up: {} producer groups made no progress for {:?}",
                        live_threads, waited
                    );
                    return Err(DrainError::Stalled {
                        live_threads,
                        waited,
                    });
                }
                interval = (interval * 2).min(self.max_poll_interval);
            }

            if buffer.is_full() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(interval).await;
            }
        }
    }

    /// One drain. Returns the number of records delivered.
    pub async fn drain_once<S: RecordSink>(
        &mut self,
        buffer: &TraceBuffer,
        sink: &mut S,
        report: &mut DrainReport,
    ) -> Result<usize, DrainError> {
        let records = buffer.drain();
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        let record_type = records.record_type();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let batch = TraceBatch::new(sequence, system_time_nanos(), records);
        self.deliver(sink, &batch).await?;

        metrics::RECORDS_DRAINED
            .with_label_values(&[record_type.as_str()])
            .inc_by(count as f64);
        metrics::DRAIN_BATCHES.inc();
        report.records += count as u64;
        report.batches += 1;
        debug!("Drained {} records (seq={})", count, sequence);
        Ok(count)
    }

    async fn deliver<S: RecordSink>(
        &self,
        sink: &mut S,
        batch: &TraceBatch,
    ) -> Result<(), DrainError> {
        let mut delay = SINK_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match sink.accept(batch) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.sink_attempts => {
                    warn!(
                        "sink rejected batch {} (attempt {}/{}): {}",
                        batch.sequence, attempt, self.sink_attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(SINK_RETRY_DELAY_MAX);
                    attempt += 1;
                }
                Err(cause) => {
                    return Err(DrainError::Sink {
                        sequence: batch.sequence,
                        cause,
                    })
                }
            }
        }
    }

    /// Give up on a launch after a failed run: abort the buffer so waiting
    /// producers bail out, then drain and discard until every group has
    /// finished. Returns false if groups are still live after the stall
    /// timeout.
    pub async fn abandon(&self, buffer: &TraceBuffer) -> bool {
        buffer.abort();
        let mut discarded = 0;
        let mut last_progress = Instant::now();
        loop {
            let complete = buffer.is_complete();
            let drained = buffer.drain().len();
            discarded += drained;

            if complete {
                warn!("Discarded {} records after aborting the drain", discarded);
                return true;
            }
            if drained > 0 {
                last_progress = Instant::now();
                tokio::task::yield_now().await;
                continue;
            }
            if last_progress.elapsed() >= self.stall_timeout {
                warn!(
                    "{} producer groups still live after aborting the drain",
                    buffer.live_threads()
                );
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn finish(&self, buffer: &TraceBuffer, mut report: DrainReport) -> DrainReport {
        report.dropped = buffer.dropped();
        metrics::RECORDS_DROPPED.inc_by(report.dropped as f64);
        if let Some(dict) = buffer.address_dict() {
            metrics::DICT_OVERFLOWS.set(dict.overflowed() as f64);
        }
        info!(
            "Drain complete: {} records in {} batches over {} polls ({} dropped)",
            report.records, report.batches, report.polls, report.dropped
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use gpu_patch_shared::{AccessFlags, DrainedRecords, RecordType, WarpAccess};
    use std::sync::Arc;

    fn config(stall_timeout_ms: u64) -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 1,
            max_poll_interval_ms: 4,
            stall_timeout_ms,
            ..SessionConfig::default()
        }
    }

    fn access(pc: u64) -> WarpAccess {
        WarpAccess::new(pc, AccessFlags::READ, 4).with_lane(0, 0x1000 + pc, &[1, 2, 3, 4])
    }

    fn buffer(capacity: u32, record_type: RecordType, groups: u32) -> TraceBuffer {
        TraceBuffer::builder(capacity)
            .record_type(record_type)
            .num_threads(groups)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_completed_empty_buffer() {
        let buffer = buffer(4, RecordType::Full, 0);
        let mut sink = CollectingSink::new();
        let report = Drainer::new(&config(1000)).run(&buffer, &mut sink).await.unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(report.batches, 0);
        assert_eq!(report.polls, 1);
        assert!(sink.batches.is_empty());
    }

    #[tokio::test]
    async fn test_final_drain_after_completion() {
        let buffer = buffer(8, RecordType::Address, 1);
        for pc in 0..5 {
            buffer.record_access(&access(pc * 8)).unwrap();
        }
        buffer.finish_group();

        let mut sink = CollectingSink::new();
        let report = Drainer::new(&config(1000)).run(&buffer, &mut sink).await.unwrap();
        assert_eq!(report.records, 5);
        assert_eq!(sink.record_count(), 5);
        match &sink.batches[0].records {
            DrainedRecords::Address(records) => assert_eq!(records[4].pc, 32),
            other => panic!("unexpected records {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sequences_increase_from_one() {
        let buffer = buffer(2, RecordType::Full, 1);
        let mut drainer = Drainer::new(&config(1000));
        let mut sink = CollectingSink::new();
        let mut report = DrainReport::default();

        buffer.record_access(&access(0)).unwrap();
        assert_eq!(drainer.drain_once(&buffer, &mut sink, &mut report).await.unwrap(), 1);
        assert_eq!(drainer.drain_once(&buffer, &mut sink, &mut report).await.unwrap(), 0);
        buffer.record_access(&access(8)).unwrap();
        drainer.drain_once(&buffer, &mut sink, &mut report).await.unwrap();

        let sequences: Vec<u64> = sink.batches.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(report.batches, 2);
    }

    #[tokio::test]
    async fn test_concurrent_producers_conserved() {
        let buffer = Arc::new(buffer(8, RecordType::Full, 4));
        let producers: Vec<_> = (0..4u64)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        buffer.record_access(&access((t * 1000 + i) * 8)).unwrap();
                    }
                    buffer.finish_group();
                })
            })
            .collect();

        let mut sink = CollectingSink::new();
        let report = Drainer::new(&config(10_000)).run(&buffer, &mut sink).await.unwrap();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(report.records, 1000);
        let mut pcs: Vec<u64> = sink
            .batches
            .iter()
            .flat_map(|b| match &b.records {
                DrainedRecords::Full(records) => records.iter().map(|r| r.pc).collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect();
        pcs.sort_unstable();
        pcs.dedup();
        assert_eq!(pcs.len(), 1000);
    }

    #[tokio::test]
    async fn test_stall_timeout() {
        let buffer = buffer(4, RecordType::Full, 2);
        let mut sink = CollectingSink::new();
        let err = Drainer::new(&config(20)).run(&buffer, &mut sink).await.unwrap_err();
        match err {
            DrainError::Stalled {
                live_threads,
                waited,
            } => {
                assert_eq!(live_threads, 2);
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_completion_observed_within_bounded_polls() {
        let buffer = Arc::new(buffer(4, RecordType::Full, 1));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                buffer.finish_group();
            })
        };

        let mut sink = CollectingSink::new();
        let report = Drainer::new(&config(10_000)).run(&buffer, &mut sink).await.unwrap();
        producer.join().unwrap();

        // Idle polls are at least 1ms apart and capped at 4ms.
        assert!(report.polls >= 2);
        assert!(report.polls <= 25, "took {} polls", report.polls);
    }

    struct FlakySink {
        failures_left: u32,
        inner: CollectingSink,
    }

    impl RecordSink for FlakySink {
        fn accept(&mut self, batch: &TraceBatch) -> anyhow::Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                anyhow::bail!("transient write failure");
            }
            self.inner.accept(batch)
        }
    }

    #[tokio::test]
    async fn test_sink_retried() {
        let buffer = buffer(4, RecordType::Full, 0);
        buffer.record_access(&access(0)).unwrap();

        let mut sink = FlakySink {
            failures_left: 2,
            inner: CollectingSink::new(),
        };
        let report = Drainer::new(&config(1000)).run(&buffer, &mut sink).await.unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(sink.inner.record_count(), 1);
    }

    #[tokio::test]
    async fn test_abandon_releases_blocked_producers() {
        let buffer = Arc::new(buffer(2, RecordType::Full, 2));
        let producers: Vec<_> = (0..2u64)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let mut aborted = 0;
                    for i in 0..100u64 {
                        if buffer.record_access(&access((t * 100 + i) * 8)).is_err() {
                            aborted += 1;
                        }
                    }
                    buffer.finish_group();
                    aborted
                })
            })
            .collect();

        let drainer = Drainer::new(&config(5_000));
        assert!(drainer.abandon(&buffer).await);
        let aborted: u32 = producers.into_iter().map(|p| p.join().unwrap()).sum();
        assert!(aborted > 0);
        assert!(buffer.is_aborted());
    }

    #[tokio::test]
    async fn test_sink_gives_up() {
        let buffer = buffer(4, RecordType::Full, 0);
        buffer.record_access(&access(0)).unwrap();

        let mut sink = FlakySink {
            failures_left: u32::MAX,
            inner: CollectingSink::new(),
        };
        let err = Drainer::new(&config(1000)).run(&buffer, &mut sink).await.unwrap_err();
        assert!(matches!(err, DrainError::Sink { sequence: 1, .. }));
        assert!(err.to_string().contains("transient write failure"));
    }
}
