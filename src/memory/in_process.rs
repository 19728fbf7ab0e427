//! Heap-backed region backend for a single process.
//!
//! Follows the same lock-word protocol as the shared-memory backend but keeps
//! everything on the heap. Used by tests and by embedders that only need the
//! budget and eviction policy. Supports failure injection and tracks live
//! regions for leak detection.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BackendError;

use super::backend::{ClientView, DiscardableRegion, RegionBackend};
use super::clock::Timestamp;
use super::shared_state::{self, LockResult, PurgeOutcome, SharedState};

/// Pid of the process the backend runs in. Always alive.
pub const CURRENT_PROCESS: u32 = 0;

struct Block {
    word: AtomicU64,
    /// Set by the first successful share. A region is shared at most once.
    shared: AtomicBool,
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: `data` is only touched through the one `InProcessView` built from
// the one `InProcessShared` a region can ever hand out (`shared` guards
// that), with writes tied to `&mut self`. The host-side region never reads
// or writes `data`; it only uses the atomic lock word.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

struct Counters {
    live: AtomicUsize,
    purged: AtomicUsize,
}

/// Host-side handle for an in-process region.
pub struct InProcessRegion {
    block: Arc<Block>,
    mapped_size: usize,
    last_known_usage: Timestamp,
    counters: Arc<Counters>,
}

impl DiscardableRegion for InProcessRegion {
    fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    fn last_known_usage(&self) -> Timestamp {
        self.last_known_usage
    }

    fn purge(&mut self, now: Timestamp) -> bool {
        match shared_state::try_purge(&self.block.word, self.last_known_usage) {
            PurgeOutcome::Purged => {
                self.last_known_usage = Timestamp::NULL;
                self.counters.purged.fetch_add(1, Ordering::Relaxed);
                true
            }
            PurgeOutcome::Locked => {
                self.last_known_usage = now;
                false
            }
            PurgeOutcome::UsedSince(ts) => {
                self.last_known_usage = ts;
                false
            }
        }
    }

    fn release(self) {
        drop(self);
    }
}

impl Drop for InProcessRegion {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// What a client receives for an in-process region.
pub struct InProcessShared {
    block: Arc<Block>,
    target: u32,
}

impl InProcessShared {
    /// Pid the region was shared with.
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Open a client view directly, without going through the backend.
    pub fn into_view(self) -> InProcessView {
        InProcessView { block: self.block }
    }
}

/// Client-side view of an in-process region.
pub struct InProcessView {
    block: Arc<Block>,
}

impl InProcessView {
    /// Current decoded lock word.
    pub fn state(&self) -> SharedState {
        SharedState::decode(self.block.word.load(Ordering::Acquire))
    }
}

impl ClientView for InProcessView {
    fn lock(&mut self) -> LockResult {
        shared_state::try_lock(&self.block.word)
    }

    fn unlock(&mut self, now: Timestamp) {
        if !shared_state::unlock(&self.block.word, now) {
            tracing::trace!("unlock on a segment that is not locked");
        }
    }

    fn len(&self) -> usize {
        self.data().len()
    }

    fn data(&self) -> &[u8] {
        // SAFETY: see `Block`; shared reads are tied to `&self`.
        unsafe { &*self.block.data.get() }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Block`; this view is the only writer.
        unsafe { &mut *self.block.data.get() }
    }
}

/// Heap-backed backend with failure injection.
pub struct InProcessBackend {
    granularity: usize,
    counters: Arc<Counters>,
    processes: Mutex<HashSet<u32>>,
    fail_next_create: AtomicBool,
    fail_next_share: AtomicBool,
    fail_next_map: AtomicBool,
}

impl InProcessBackend {
    /// Mapped size equals the requested size.
    pub fn new() -> Self {
        Self::with_granularity(1)
    }

    /// Mapped size is the requested size rounded up to `granularity`,
    /// the way a real mapping rounds to pages.
    pub fn with_granularity(granularity: usize) -> Self {
        let mut processes = HashSet::new();
        processes.insert(CURRENT_PROCESS);
        Self {
            granularity: granularity.max(1),
            counters: Arc::new(Counters {
                live: AtomicUsize::new(0),
                purged: AtomicUsize::new(0),
            }),
            processes: Mutex::new(processes),
            fail_next_create: AtomicBool::new(false),
            fail_next_share: AtomicBool::new(false),
            fail_next_map: AtomicBool::new(false),
        }
    }

    /// Mark a fake client process alive.
    pub fn spawn_process(&self, pid: u32) {
        self.processes.lock().insert(pid);
    }

    /// Mark a fake client process dead; sharing to it fails afterwards.
    pub fn kill_process(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_share(&self) {
        self.fail_next_share.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::SeqCst);
    }

    /// Regions created and not yet released. Used for leak detection.
    pub fn live_regions(&self) -> usize {
        self.counters.live.load(Ordering::Relaxed)
    }

    /// Successful purges so far.
    pub fn purged_regions(&self) -> usize {
        self.counters.purged.load(Ordering::Relaxed)
    }

    fn round_up(&self, size: usize) -> Option<usize> {
        let rem = size % self.granularity;
        if rem == 0 {
            Some(size)
        } else {
            size.checked_add(self.granularity - rem)
        }
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionBackend for InProcessBackend {
    type Region = InProcessRegion;
    type Process = u32;
    type Shared = InProcessShared;
    type View = InProcessView;

    fn create_and_map(&self, size: usize, now: Timestamp) -> Result<InProcessRegion, BackendError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(BackendError::InjectedFailure("create_and_map"));
        }
        if size == 0 {
            return Err(BackendError::InvalidSize(size));
        }
        let mapped_size = self.round_up(size).ok_or(BackendError::InvalidSize(size))?;

        let block = Arc::new(Block {
            word: AtomicU64::new(SharedState::Locked.encode()),
            shared: AtomicBool::new(false),
            data: UnsafeCell::new(vec![0u8; mapped_size].into_boxed_slice()),
        });
        self.counters.live.fetch_add(1, Ordering::Relaxed);

        Ok(InProcessRegion {
            block,
            mapped_size,
            last_known_usage: now,
            counters: self.counters.clone(),
        })
    }

    fn share_to_process(
        &self,
        region: &InProcessRegion,
        target: &u32,
    ) -> Result<InProcessShared, BackendError> {
        if self.fail_next_share.swap(false, Ordering::SeqCst) {
            return Err(BackendError::InjectedFailure("share_to_process"));
        }
        if !self.processes.lock().contains(target) {
            return Err(BackendError::ProcessNotFound(target.to_string()));
        }
        if region.block.shared.swap(true, Ordering::AcqRel) {
            return Err(BackendError::AlreadyShared);
        }
        Ok(InProcessShared {
            block: region.block.clone(),
            target: *target,
        })
    }

    fn current_process(&self) -> u32 {
        CURRENT_PROCESS
    }

    fn map_shared(&self, shared: InProcessShared) -> Result<InProcessView, BackendError> {
        if self.fail_next_map.swap(false, Ordering::SeqCst) {
            return Err(BackendError::InjectedFailure("map_shared"));
        }
        Ok(shared.into_view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_rounds_mapped_size_up() {
        let backend = InProcessBackend::with_granularity(64);
        let region = backend.create_and_map(65, Timestamp(1)).unwrap();
        assert_eq!(region.mapped_size(), 128);
    }

    #[test]
    fn live_regions_track_release() {
        let backend = InProcessBackend::new();
        let a = backend.create_and_map(10, Timestamp(1)).unwrap();
        let b = backend.create_and_map(10, Timestamp(1)).unwrap();
        assert_eq!(backend.live_regions(), 2);
        a.release();
        drop(b);
        assert_eq!(backend.live_regions(), 0);
    }

    #[test]
    fn injected_failures_fire_once() {
        let backend = InProcessBackend::new();
        backend.fail_next_create();
        assert!(backend.create_and_map(10, Timestamp(1)).is_err());
        let region = backend.create_and_map(10, Timestamp(1)).unwrap();

        backend.fail_next_share();
        assert!(backend.share_to_process(&region, &CURRENT_PROCESS).is_err());
        assert!(backend.share_to_process(&region, &CURRENT_PROCESS).is_ok());
    }

    #[test]
    fn sharing_to_dead_process_fails() {
        let backend = InProcessBackend::new();
        let region = backend.create_and_map(10, Timestamp(1)).unwrap();
        backend.spawn_process(7);
        backend.kill_process(7);
        assert!(matches!(
            backend.share_to_process(&region, &7),
            Err(BackendError::ProcessNotFound(_))
        ));
        // A failed share does not use up the region.
        backend.spawn_process(7);
        assert!(backend.share_to_process(&region, &7).is_ok());
    }

    #[test]
    fn region_is_shared_at_most_once() {
        let backend = InProcessBackend::new();
        let region = backend.create_and_map(10, Timestamp(1)).unwrap();
        backend.spawn_process(7);

        let shared = backend.share_to_process(&region, &CURRENT_PROCESS).unwrap();
        assert!(matches!(
            backend.share_to_process(&region, &CURRENT_PROCESS),
            Err(BackendError::AlreadyShared)
        ));
        assert!(matches!(
            backend.share_to_process(&region, &7),
            Err(BackendError::AlreadyShared)
        ));
        assert_eq!(shared.target(), CURRENT_PROCESS);
    }

    #[test]
    fn unlock_after_purge_does_not_revive_contents() {
        let backend = InProcessBackend::new();
        let mut region = backend.create_and_map(16, Timestamp(1)).unwrap();
        let shared = backend.share_to_process(&region, &CURRENT_PROCESS).unwrap();
        let mut view = backend.map_shared(shared).unwrap();

        view.unlock(Timestamp(7));
        assert!(!region.purge(Timestamp(8)));
        assert!(region.purge(Timestamp(8)));

        view.unlock(Timestamp(9));
        assert!(view.state().is_purged());
        assert_eq!(view.lock(), LockResult::Purged);
    }

    #[test]
    fn purge_follows_client_lock() {
        let backend = InProcessBackend::new();
        let mut region = backend.create_and_map(16, Timestamp(1)).unwrap();
        let shared = backend.share_to_process(&region, &CURRENT_PROCESS).unwrap();
        let mut view = backend.map_shared(shared).unwrap();

        // Created locked.
        assert!(!region.purge(Timestamp(5)));
        assert_eq!(region.last_known_usage(), Timestamp(5));

        view.data_mut()[0] = 42;
        view.unlock(Timestamp(6));
        // Host learns about the newer unlock first, then purges.
        assert!(!region.purge(Timestamp(7)));
        assert_eq!(region.last_known_usage(), Timestamp(6));
        assert!(region.purge(Timestamp(7)));
        assert_eq!(view.lock(), LockResult::Purged);
        assert_eq!(backend.purged_regions(), 1);
    }
}
