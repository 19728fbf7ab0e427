//! Shared-memory backend driven through the manager.

#![cfg(target_os = "linux")]

use std::sync::Arc;

use discardable_host::memory::{
    ClientView, LockResult, ManualClock, MemfdView, RegionBackend, SharedState,
};
use discardable_host::{ClientId, DiscardableMemoryManager, ManagerConfig, MemfdBackend, SegmentId};

fn manager(memory_limit: usize) -> (DiscardableMemoryManager<MemfdBackend>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let config = ManagerConfig {
        memory_limit,
        ..ManagerConfig::default()
    };
    let manager = DiscardableMemoryManager::with_clock(config, MemfdBackend::new(), clock.clone());
    (manager, clock)
}

fn page() -> usize {
    rustix::param::page_size()
}

#[test]
fn mapped_size_counts_header_page() {
    let (manager, _clock) = manager(64 * page());
    let me = manager.backend().current_process();

    let fd = manager
        .allocate_locked_segment(&me, ClientId(1), page(), SegmentId(1))
        .unwrap();
    assert_eq!(manager.bytes_allocated(), 2 * page());

    let view = MemfdView::from_fd(fd).unwrap();
    assert_eq!(view.len(), page());
    assert_eq!(view.state(), SharedState::Locked);
}

#[test]
fn purge_is_visible_through_client_mapping() {
    let (manager, clock) = manager(4 * page());
    let me = manager.backend().current_process();

    let fd = manager
        .allocate_locked_segment(&me, ClientId(1), page(), SegmentId(1))
        .unwrap();
    let mut client = manager.backend().map_shared(fd).unwrap();
    client.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
    client.unlock(clock.advance(1));
    clock.advance(1);

    // More than two pages of headroom needed: the first segment must go.
    let _other = manager
        .allocate_locked_segment(&me, ClientId(2), 2 * page() + 1, SegmentId(1))
        .unwrap();
    assert!(!manager.contains(ClientId(1), SegmentId(1)));
    assert_eq!(client.state(), SharedState::Unlocked(discardable_host::memory::Timestamp::NULL));
    assert_eq!(client.lock(), LockResult::Purged);
}

#[test]
fn host_local_memory_round_trips_data() {
    let (manager, _clock) = manager(64 * page());

    let mut memory = manager.allocate_locked_discardable_memory(100).unwrap();
    assert_eq!(memory.len(), page());
    memory.data_mut().unwrap()[..3].copy_from_slice(b"abc");
    memory.unlock();
    assert!(memory.lock());
    assert_eq!(&memory.data().unwrap()[..3], b"abc");

    drop(memory);
    assert_eq!(manager.bytes_allocated(), 0);
}

#[test]
fn many_segments_do_not_exhaust_descriptors() {
    let (manager, _clock) = manager(usize::MAX / 2);
    let me = manager.backend().current_process();

    // Descriptors are closed once shared; only the returned copies stay open.
    for id in 0..2048 {
        let fd = manager
            .allocate_locked_segment(&me, ClientId(1), 1, SegmentId(id))
            .unwrap();
        drop(fd);
    }
    assert_eq!(manager.segment_count(), 2048);
    manager.remove_client(ClientId(1));
    assert_eq!(manager.bytes_allocated(), 0);
}
