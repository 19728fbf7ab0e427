//! Telemetry for the discardable memory host.
//!
//! Structured logging, allocation spans and metrics. Nothing here feeds back
//! into eviction decisions.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_allocation_failure, record_bytes_allocated, record_enforcement_pass,
    record_eviction, record_memory_limit, record_pressure_signal, ALLOCATION_FAILURES,
    BYTES_ALLOCATED, BYTES_EVICTED, ENFORCEMENT_PASSES, MEMORY_LIMIT, PRESSURE_SIGNALS,
    SEGMENTS_EVICTED,
};
pub use spans::{AllocationSpan, SpanExt};
