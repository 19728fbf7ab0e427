//! Error types for the discardable memory host.
//!
//! Every failure is recovered locally and returned as a value: a failed
//! allocation leaves no accounting behind, a failed delete mutates nothing.

use thiserror::Error;

use crate::process::{ClientId, SegmentId};

/// Errors surfaced by the region backends (create, map, share).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid region size: {0} bytes")]
    InvalidSize(usize),

    #[error("Target process not found: {0}")]
    ProcessNotFound(String),

    #[error("Region already shared")]
    AlreadyShared,

    #[error("Injected failure: {0}")]
    InjectedFailure(&'static str),
}

/// Errors returned by the segment manager.
#[derive(Debug, Error)]
pub enum DiscardableError {
    #[error("Segment id {id} already in use by client {client}")]
    DuplicateIdentifier { client: ClientId, id: SegmentId },

    #[error("Failed to create and map {size} bytes: {source}")]
    MappingFailed {
        size: usize,
        #[source]
        source: BackendError,
    },

    #[error("Failed to share segment with client {client}: {source}")]
    SharingFailed {
        client: ClientId,
        #[source]
        source: BackendError,
    },

    #[error("Allocated byte counter overflow: {current} + {requested}")]
    CounterOverflow { current: usize, requested: usize },

    #[error("Unknown segment id {id} for client {client}")]
    NotFound { client: ClientId, id: SegmentId },

    #[error("Client {0} has no live process")]
    ProcessGone(ClientId),
}

impl DiscardableError {
    /// Returns true if the error points at a caller bug rather than an
    /// environmental failure.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::DuplicateIdentifier { .. } | Self::NotFound { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateIdentifier { .. } => "duplicate_identifier",
            Self::MappingFailed { .. } => "mapping_failed",
            Self::SharingFailed { .. } => "sharing_failed",
            Self::CounterOverflow { .. } => "counter_overflow",
            Self::NotFound { .. } => "not_found",
            Self::ProcessGone(_) => "process_gone",
        }
    }
}

/// Result type local to this crate.
pub type Result<T> = std::result::Result<T, DiscardableError>;
