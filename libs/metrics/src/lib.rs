//! Thin wrapper around the prometheus crate. Every workspace member goes
//! through these re-exports, so a single dep version (and therefore a
//! single default registry) is shared by all registered metrics.

pub use prometheus::{core, default_registry, proto};
pub use prometheus::{exponential_buckets, linear_buckets};
pub use prometheus::{register_gauge, Gauge};
pub use prometheus::{register_histogram, Histogram};
pub use prometheus::{register_histogram_vec, HistogramVec};
pub use prometheus::{register_int_counter, IntCounter};
pub use prometheus::{register_int_counter_vec, IntCounterVec};
pub use prometheus::{register_int_gauge, IntGauge};
pub use prometheus::{register_int_gauge_vec, IntGaugeVec};
pub use prometheus::{Encoder, TextEncoder};

/// Gather everything registered in the default registry.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    prometheus::gather()
}
