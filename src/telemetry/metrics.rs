//! Metrics facade bindings for the discardable memory host.
//!
//! Values go through the `metrics` crate; with no recorder installed every
//! call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

pub const BYTES_ALLOCATED: &str = "discardable_bytes_allocated";
pub const MEMORY_LIMIT: &str = "discardable_memory_limit";
pub const SEGMENTS_EVICTED: &str = "discardable_segments_evicted_total";
pub const BYTES_EVICTED: &str = "discardable_bytes_evicted_total";
pub const ALLOCATION_FAILURES: &str = "discardable_allocation_failures_total";
pub const PRESSURE_SIGNALS: &str = "discardable_memory_pressure_signals_total";
pub const ENFORCEMENT_PASSES: &str = "discardable_enforcement_passes_total";

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_gauge!(BYTES_ALLOCATED, Unit::Bytes, "Bytes mapped across all live segments");
    describe_gauge!(MEMORY_LIMIT, Unit::Bytes, "Configured discardable memory budget");
    describe_counter!(SEGMENTS_EVICTED, "Segments purged by eviction passes");
    describe_counter!(BYTES_EVICTED, Unit::Bytes, "Bytes released by eviction passes");
    describe_counter!(ALLOCATION_FAILURES, "Failed segment allocations by kind");
    describe_counter!(PRESSURE_SIGNALS, "Memory pressure signals received by level");
    describe_counter!(ENFORCEMENT_PASSES, "Deferred enforcement passes run");
}

pub fn record_bytes_allocated(bytes: usize) {
    gauge!(BYTES_ALLOCATED).set(bytes as f64);
}

pub fn record_memory_limit(limit: usize) {
    gauge!(MEMORY_LIMIT).set(limit as f64);
}

pub fn record_eviction(segments: usize, bytes: usize) {
    counter!(SEGMENTS_EVICTED).increment(segments as u64);
    counter!(BYTES_EVICTED).increment(bytes as u64);
}

pub fn record_allocation_failure(kind: &'static str) {
    counter!(ALLOCATION_FAILURES, "kind" => kind).increment(1);
}

pub fn record_pressure_signal(level: &'static str) {
    counter!(PRESSURE_SIGNALS, "level" => level).increment(1);
}

pub fn record_enforcement_pass() {
    counter!(ENFORCEMENT_PASSES).increment(1);
}
