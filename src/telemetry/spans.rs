//! Span utilities and extension traits for allocation tracing.

use tracing::{info_span, Span};

use crate::process::{ClientId, SegmentId};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for allocation spans.
pub struct AllocationSpan;

impl AllocationSpan {
    /// Fields:
    /// - `client`, `segment_id`, `requested_bytes`: set at creation
    /// - `mapped_bytes`: filled in once the region is mapped
    /// - `status`, `error.message`: filled in by `SpanExt::record_result`
    pub fn new(client: ClientId, id: SegmentId, requested_bytes: usize) -> Span {
        info_span!(
            "discardable_allocation",
            client = %client,
            segment_id = id.0,
            requested_bytes,
            mapped_bytes = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
