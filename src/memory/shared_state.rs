//! Lock word shared between the host and the client of a region.
//!
//! The first 8 bytes of every region hold `(timestamp << 1) | locked`.
//! The client sets the lock bit on an unpurged word and clears it on a
//! locked one. The host only ever swaps an unlocked word it has already
//! observed for the purged marker (`0`), so a purge can never race past a
//! concurrent lock.

use std::sync::atomic::{AtomicU64, Ordering};

use super::clock::Timestamp;

/// Decoded view of the lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedState {
    Locked,
    Unlocked(Timestamp),
}

impl SharedState {
    /// Unlocked with a null timestamp.
    pub const PURGED: SharedState = SharedState::Unlocked(Timestamp::NULL);

    pub fn encode(self) -> u64 {
        match self {
            SharedState::Locked => 1,
            SharedState::Unlocked(ts) => ts.as_micros() << 1,
        }
    }

    pub fn decode(word: u64) -> Self {
        if word & 1 == 1 {
            SharedState::Locked
        } else {
            SharedState::Unlocked(Timestamp(word >> 1))
        }
    }

    pub fn is_purged(&self) -> bool {
        *self == Self::PURGED
    }
}

/// Outcome of a host-side purge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged,
    /// The client holds the lock.
    Locked,
    /// Unlocked, but the client used it more recently than the host knew.
    UsedSince(Timestamp),
}

/// Outcome of a client-side lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Success,
    /// The host purged the contents; the region is unusable.
    Purged,
    /// Already locked; the caller is holding it twice.
    AlreadyLocked,
}

/// Host side: swap `Unlocked(last_known)` for the purged marker.
pub fn try_purge(word: &AtomicU64, last_known: Timestamp) -> PurgeOutcome {
    let expected = SharedState::Unlocked(last_known).encode();
    match word.compare_exchange(
        expected,
        SharedState::PURGED.encode(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => PurgeOutcome::Purged,
        Err(observed) => match SharedState::decode(observed) {
            SharedState::Locked => PurgeOutcome::Locked,
            SharedState::Unlocked(ts) => PurgeOutcome::UsedSince(ts),
        },
    }
}

/// Client side: take the lock unless the region was purged.
pub fn try_lock(word: &AtomicU64) -> LockResult {
    let mut current = word.load(Ordering::Acquire);
    loop {
        let state = SharedState::decode(current);
        if state.is_purged() {
            return LockResult::Purged;
        }
        if state == SharedState::Locked {
            return LockResult::AlreadyLocked;
        }
        match word.compare_exchange_weak(
            current,
            SharedState::Locked.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return LockResult::Success,
            Err(observed) => current = observed,
        }
    }
}

/// Client side: release the lock, stamping the usage time.
///
/// Only a locked word is released. Returns false and leaves the word alone
/// otherwise, so a purged region stays purged.
pub fn unlock(word: &AtomicU64, now: Timestamp) -> bool {
    // A null stamp would read as purged.
    let now = if now.is_null() { Timestamp(1) } else { now };
    word.compare_exchange(
        SharedState::Locked.encode(),
        SharedState::Unlocked(now).encode(),
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .is_ok()
}
