use metrics::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use once_cell::sync::Lazy;

/// Buckets for per-record replay time. Replay of a single record is
/// usually in the microsecond range, with a long tail when the page fix
/// blocks.
const REDO_SYNC_BUCKETS: &[f64] = &[
    0.000_001, 0.000_010, 0.000_100, // 1 us, 10 us, 100 us
    0.001_000, 0.010_000, 0.100_000, // 1 ms, 10 ms, 100 ms
    1.0,
];

pub static REPLICATION_DELAY_MSEC: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "walreplay_replication_delay_msec",
        "Milliseconds between record generation on the primary and replay completion"
    )
    .expect("failed to register walreplay_replication_delay_msec gauge")
});

pub static REDO_SYNC_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "walreplay_redo_sync_seconds",
        "Time the replay driver spends on a single log record",
        REDO_SYNC_BUCKETS.to_vec()
    )
    .expect("failed to register walreplay_redo_sync_seconds histogram")
});

pub static WAL_RECORDS_APPLIED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "walreplay_records_applied_total",
        "Log records whose redo effect has been applied"
    )
    .expect("failed to register walreplay_records_applied_total counter")
});
