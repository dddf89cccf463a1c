//! Prometheus metrics for drain sessions

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

// ── Drain metrics ────────────────────────────────────────────────────────────

pub static RECORDS_DRAINED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gpu_patch_records_drained_total",
        "Records copied out of the trace buffer",
        &["type"]
    )
    .unwrap()
});

pub static DRAIN_BATCHES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gpu_patch_drain_batches_total",
        "Non-empty drains delivered to a sink"
    )
    .unwrap()
});

pub static DRAIN_STALLS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gpu_patch_drain_stalls_total",
        "Sessions abandoned because producers stopped making progress"
    )
    .unwrap()
});

pub static RECORDS_DROPPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gpu_patch_records_dropped_total",
        "Records producers gave up on after stalling on a full buffer"
    )
    .unwrap()
});

// ── Buffer and dictionary metrics ────────────────────────────────────────────

pub static BUFFER_UTILIZATION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gpu_patch_buffer_utilization",
        "Pending records as a fraction of buffer capacity at the last poll"
    )
    .unwrap()
});

pub static DICT_OVERFLOWS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gpu_patch_address_dict_overflows",
        "Address dictionary updates that fell back to queued records"
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
