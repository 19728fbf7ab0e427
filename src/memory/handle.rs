//! Host-local discardable memory: a segment the host allocates for itself
//! and maps in its own address space.

use std::sync::Arc;

use crate::error::DiscardableError;
use crate::process::{ClientId, SegmentId};

use super::backend::{ClientView, RegionBackend};
use super::clock::Clock;
use super::manager::Inner;
use super::shared_state::LockResult;

/// Locked on creation. Dropping it unlocks and deletes the backing segment.
///
/// The manager may evict the segment while it is unlocked; `lock` then
/// reports the contents as gone.
pub struct DiscardableMemory<B: RegionBackend> {
    view: B::View,
    id: SegmentId,
    locked: bool,
    manager: Arc<Inner<B>>,
}

impl<B: RegionBackend> DiscardableMemory<B> {
    pub(crate) fn new(view: B::View, id: SegmentId, manager: Arc<Inner<B>>) -> Self {
        Self {
            view,
            id,
            locked: true,
            manager,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Pin the contents. Returns false if they were purged while unlocked;
    /// the memory is then unusable and should be dropped.
    pub fn lock(&mut self) -> bool {
        if self.locked {
            return true;
        }
        match self.view.lock() {
            LockResult::Success => {
                self.locked = true;
                true
            }
            LockResult::Purged => false,
            LockResult::AlreadyLocked => {
                tracing::warn!(segment_id = self.id.0, "Host-local segment locked elsewhere");
                false
            }
        }
    }

    /// Make the contents eligible for eviction.
    pub fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        self.view.unlock(self.manager.clock().now());
        self.locked = false;
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Contents while locked.
    pub fn data(&self) -> Option<&[u8]> {
        self.locked.then(|| self.view.data())
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        if self.locked {
            Some(self.view.data_mut())
        } else {
            None
        }
    }
}

impl<B: RegionBackend> Drop for DiscardableMemory<B> {
    fn drop(&mut self) {
        self.unlock();
        match self.manager.delete_segment(ClientId::HOST, self.id) {
            Ok(()) => {}
            Err(DiscardableError::NotFound { .. }) => {
                tracing::trace!(segment_id = self.id.0, "Host-local segment already evicted");
            }
            Err(e) => {
                tracing::warn!(segment_id = self.id.0, error = %e, "Failed to delete host-local segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{
        DiscardableMemoryManager, InProcessBackend, ManagerConfig, ManualClock,
    };
    use crate::pressure::MemoryPressureLevel;

    fn manager(clock: Arc<ManualClock>) -> DiscardableMemoryManager<InProcessBackend> {
        let config = ManagerConfig {
            memory_limit: 1024,
            ..ManagerConfig::default()
        };
        DiscardableMemoryManager::with_clock(config, InProcessBackend::new(), clock)
    }

    #[test]
    fn host_memory_is_locked_and_writable() {
        let clock = Arc::new(ManualClock::default());
        let manager = manager(clock);

        let mut memory = manager.allocate_locked_discardable_memory(64).unwrap();
        assert!(memory.is_locked());
        assert_eq!(memory.len(), 64);
        memory.data_mut().unwrap()[0] = 9;
        assert_eq!(memory.data().unwrap()[0], 9);
        assert_eq!(manager.client_segment_count(ClientId::HOST), 1);

        memory.unlock();
        assert!(memory.data().is_none());
        assert!(memory.lock());
        assert_eq!(memory.data().unwrap()[0], 9);
    }

    #[test]
    fn drop_deletes_segment() {
        let clock = Arc::new(ManualClock::default());
        let manager = manager(clock);

        let memory = manager.allocate_locked_discardable_memory(100).unwrap();
        assert_eq!(manager.bytes_allocated(), 100);
        drop(memory);
        assert_eq!(manager.bytes_allocated(), 0);
        assert_eq!(manager.backend().live_regions(), 0);
    }

    #[test]
    fn evicted_memory_fails_to_lock_and_drops_cleanly() {
        let clock = Arc::new(ManualClock::default());
        let manager = manager(clock.clone());

        let mut memory = manager.allocate_locked_discardable_memory(100).unwrap();
        clock.advance(10);
        memory.unlock();
        clock.advance(10);

        let report = manager.on_memory_pressure(MemoryPressureLevel::Critical);
        assert_eq!(report.segments, 1);
        assert!(!memory.lock());
        assert!(!memory.is_locked());

        drop(memory);
        assert_eq!(manager.segment_count(), 0);
    }

    #[test]
    fn local_ids_are_unique() {
        let clock = Arc::new(ManualClock::default());
        let manager = manager(clock);

        let a = manager.allocate_locked_discardable_memory(8).unwrap();
        let b = manager.allocate_locked_discardable_memory(8).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
