//! One tracked region plus the bookkeeping the manager keeps for it.

use crate::process::{ClientId, SegmentId};

use super::backend::DiscardableRegion;
use super::clock::Timestamp;

/// A live segment. Owned by the manager's arena; the registry and the
/// eviction order refer to it by arena key.
pub struct Segment<R: DiscardableRegion> {
    client: ClientId,
    id: SegmentId,
    region: R,
    /// Timestamp under which the segment currently sits in the eviction
    /// order. Needed to find its entry again.
    queued_at: Timestamp,
}

impl<R: DiscardableRegion> Segment<R> {
    pub fn new(client: ClientId, id: SegmentId, region: R) -> Self {
        let queued_at = region.last_known_usage();
        Self {
            client,
            id,
            region,
            queued_at,
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn mapped_size(&self) -> usize {
        self.region.mapped_size()
    }

    pub fn last_used(&self) -> Timestamp {
        self.region.last_known_usage()
    }

    pub fn queued_at(&self) -> Timestamp {
        self.queued_at
    }

    /// Record the timestamp the segment was (re)queued under.
    pub fn requeue(&mut self) -> Timestamp {
        self.queued_at = self.region.last_known_usage();
        self.queued_at
    }

    /// Attempt to discard the contents. On failure the usage time has been
    /// refreshed by the region and the caller should requeue.
    pub fn purge(&mut self, now: Timestamp) -> bool {
        self.region.purge(now)
    }

    /// Unmap and close the region.
    pub fn release(self) {
        self.region.release();
    }
}
