// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Region backend traits: how a segment's memory is created, shared,
//! purged and released.

use crate::error::BackendError;

use super::clock::Timestamp;
use super::shared_state::LockResult;

/// Host-side handle to one mapped region.
pub trait DiscardableRegion: Send {
    /// Bytes actually mapped. May exceed the requested size.
    fn mapped_size(&self) -> usize;

    /// Most recent usage time the host knows about.
    fn last_known_usage(&self) -> Timestamp;

    /// Try to discard the contents. Fails while the client holds the lock,
    /// in which case `last_known_usage` is refreshed (to `now`, or to the
    /// client's newer unlock time).
    fn purge(&mut self, now: Timestamp) -> bool;

    /// Drop the descriptor once it has been shared. The mapping stays.
    fn close(&mut self) {}

    /// Unmap and close. Consumes the region so it runs once.
    fn release(self)
    where
        Self: Sized;
}

/// Client-side mapping of a shared region.
pub trait ClientView: Send {
    fn lock(&mut self) -> LockResult;

    /// Release the lock. Does nothing unless the view holds it.
    fn unlock(&mut self, now: Timestamp);

    /// Usable payload size (excludes the lock header).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];
}

/// Creates regions and exports them to client processes.
pub trait RegionBackend: Send + Sync + 'static {
    type Region: DiscardableRegion;
    /// Handle to a process a region can be shared with.
    type Process: Send + Sync;
    /// What the client receives (e.g. a duplicated descriptor).
    type Shared: Send;
    type View: ClientView;

    /// Create a region of at least `size` payload bytes, mapped and locked.
    fn create_and_map(&self, size: usize, now: Timestamp) -> Result<Self::Region, BackendError>;

    fn share_to_process(
        &self,
        region: &Self::Region,
        target: &Self::Process,
    ) -> Result<Self::Shared, BackendError>;

    /// The process the manager itself runs in.
    fn current_process(&self) -> Self::Process;

    /// Map a shared handle on the client side.
    fn map_shared(&self, shared: Self::Shared) -> Result<Self::View, BackendError>;
}
