//! End-to-end sessions: simulated producers, live drain, analysis

use gpu_patch_host::{
    run_session, CollectingSink, DrainError, FrameSink, KernelShape, RecordSink, SessionConfig,
};
use gpu_patch_shared::protocol::wire::TraceBatch;
use gpu_patch_shared::protocol::wire::read_frame;
use gpu_patch_shared::types::PC_STRIDE;
use gpu_patch_shared::{AddressDict, RecordType};
use std::io::BufReader;
use std::time::Duration;

fn config(record_type: RecordType, buffer_records: u32) -> SessionConfig {
    SessionConfig {
        buffer_records,
        record_type,
        poll_interval_ms: 1,
        max_poll_interval_ms: 2,
        stall_timeout_ms: 10_000,
        ..SessionConfig::default()
    }
}

fn shape(groups: u32, accesses_per_group: u32) -> KernelShape {
    KernelShape {
        groups,
        accesses_per_group,
        ..KernelShape::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_records_conserved_through_small_buffer() {
    let (report, sink) = run_session(
        &config(RecordType::Full, 32),
        &shape(16, 20),
        0,
        CollectingSink::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.drain.records, 320);
    assert_eq!(sink.record_count(), 320);
    assert_eq!(report.producers.queued, 320);
    assert_eq!(report.drain.dropped, 0);
    assert_eq!(report.accesses.writes, 16 * 5);
    assert_eq!(report.accesses.reads, 16 * 15);
    assert_eq!(report.accesses.active_lanes, 320 * 32);
    assert!(report.dictionary.is_none());

    let sequences: Vec<u64> = sink.batches.iter().map(|b| b.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn test_analysis_overflow_falls_back_to_queue() {
    // 8 groups x 8 accesses x 32 lanes = 2048 distinct words.
    let (report, _) = run_session(
        &config(RecordType::AddressAnalysis, 64),
        &shape(8, 8),
        0,
        CollectingSink::new(),
    )
    .await
    .unwrap();

    let dict = report.dictionary.expect("analysis mode keeps a dictionary");
    assert_eq!(dict.entries.len(), AddressDict::CAPACITY);
    assert_eq!(dict.overflowed, 1024);
    assert_eq!(report.producers.analyzed, 1024);
    assert_eq!(report.producers.overflowed, 1024);
    assert_eq!(report.drain.records, 1024);
    assert_eq!(report.accesses.analysis_bytes, 1024 * 4);
    assert_eq!(report.accesses.record_type, Some(RecordType::AddressAnalysis));
}

#[tokio::test]
async fn test_analysis_dedups_repeated_ranges() {
    // A 512-byte footprint holds 128 words; every access wraps over them.
    let shape = KernelShape {
        footprint: 512,
        ..shape(4, 16)
    };
    let (report, sink) = run_session(
        &config(RecordType::AddressAnalysis, 16),
        &shape,
        0,
        CollectingSink::new(),
    )
    .await
    .unwrap();

    let dict = report.dictionary.unwrap();
    assert_eq!(dict.entries.len(), 128);
    assert_eq!(dict.overflowed, 0);
    // Stores always land on the last 32 words of the wrap.
    assert_eq!(dict.written_ranges, 32);
    assert_eq!(dict.read_ranges, 96);
    assert_eq!(sink.record_count(), 0);
}

#[tokio::test]
async fn test_torchview_liveness() {
    // 2 groups x 4 accesses touch the first 256 words, all inside view 0.
    let shape = KernelShape {
        footprint: 4096,
        ..shape(2, 4)
    };
    let (report, _) = run_session(&config(RecordType::Address, 16), &shape, 4, CollectingSink::new())
        .await
        .unwrap();

    assert_eq!(report.views.len(), 4);
    let first = &report.views[0];
    assert_eq!(first.first_read_pc, Some(shape.function_pc));
    assert_eq!(first.last_read_pc, Some(shape.function_pc + 2 * PC_STRIDE));
    assert_eq!(first.first_write_pc, Some(shape.function_pc + 3 * PC_STRIDE));
    assert!(report.views[1..].iter().all(|v| v.is_dead()));
}

#[tokio::test]
async fn test_block_sampling_skips_groups() {
    let config = SessionConfig {
        block_sampling_offset: 1,
        block_sampling_frequency: 4,
        ..config(RecordType::Address, 16)
    };
    // Blocks 1 and 5 of 8 are sampled: 4 of 16 groups.
    let (report, _) = run_session(&config, &shape(16, 10), 0, CollectingSink::new())
        .await
        .unwrap();

    assert_eq!(report.drain.records, 40);
    assert_eq!(report.producers.skipped, 120);
}

#[tokio::test]
async fn test_producer_spin_limit_drops_are_accounted() {
    let config = SessionConfig {
        producer_spin_limit: Some(0),
        ..config(RecordType::Full, 4)
    };
    let (report, _) = run_session(&config, &shape(8, 50), 0, CollectingSink::new())
        .await
        .unwrap();

    assert_eq!(report.drain.dropped, report.producers.dropped);
    assert_eq!(report.drain.records + report.drain.dropped, 400);
}

#[tokio::test]
async fn test_frames_written_to_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("trace.frames");
    let file = std::fs::File::create(&path).unwrap();

    let (report, sink) = run_session(
        &config(RecordType::Address, 8),
        &shape(4, 12),
        0,
        FrameSink::new(std::io::BufWriter::new(file)),
    )
    .await
    .unwrap();
    assert_eq!(sink.frames(), report.drain.batches);
    drop(sink);

    let mut reader = BufReader::new(std::fs::File::open(&path).unwrap());
    let mut records = 0;
    let mut last_sequence = 0;
    while let Some(batch) = read_frame(&mut reader).unwrap() {
        assert!(batch.sequence > last_sequence);
        last_sequence = batch.sequence;
        records += batch.records.len();
    }
    assert_eq!(records, 48);
}

#[derive(Debug)]
struct RejectingSink;

impl RecordSink for RejectingSink {
    fn accept(&mut self, _batch: &TraceBatch) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_sink_stops_producers() {
    let config = SessionConfig {
        sink_attempts: 1,
        ..config(RecordType::Full, 4)
    };
    let launch = shape(4, 64);
    let session = run_session(&config, &launch, 0, RejectingSink);

    // Producers blocked on the full buffer must be released and joined.
    let err = tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .expect("session should return once the drain fails")
        .unwrap_err();
    match err.downcast_ref::<DrainError>() {
        Some(DrainError::Sink { sequence: 1, .. }) => {}
        other => panic!("unexpected error {:?}", other),
    }
}
