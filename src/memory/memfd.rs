//! Shared-memory region backend using Linux memfd.
//!
//! Each region is an anonymous `memfd_create` file mapped `MAP_SHARED`. The
//! first page holds the lock word; the payload follows it. Sharing duplicates
//! the descriptor (close-on-exec) so the IPC layer can pass it over
//! `SCM_RIGHTS`; the client maps the same physical pages.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicU64;

use memmap2::{MmapMut, MmapOptions, UncheckedAdvice};
use rustix::process::Pid;

use crate::error::BackendError;

use super::backend::{ClientView, DiscardableRegion, RegionBackend};
use super::clock::Timestamp;
use super::shared_state::{self, LockResult, PurgeOutcome, SharedState};

/// Bytes reserved in front of the payload, rounded to a page.
fn header_size() -> usize {
    rustix::param::page_size()
}

fn lock_word(map: &MmapMut) -> &AtomicU64 {
    // SAFETY: every mapping starts page-aligned and is at least one page
    // long, so the first 8 bytes are a valid, aligned AtomicU64 for the
    // lifetime of the borrow.
    unsafe { &*(map.as_ptr() as *const AtomicU64) }
}

/// Host-side handle to a memfd region.
pub struct MemfdRegion {
    map: MmapMut,
    file: Option<File>,
    last_known_usage: Timestamp,
}

impl MemfdRegion {
    /// Whether the descriptor is still open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl DiscardableRegion for MemfdRegion {
    fn mapped_size(&self) -> usize {
        self.map.len()
    }

    fn last_known_usage(&self) -> Timestamp {
        self.last_known_usage
    }

    fn purge(&mut self, now: Timestamp) -> bool {
        match shared_state::try_purge(lock_word(&self.map), self.last_known_usage) {
            PurgeOutcome::Purged => {}
            PurgeOutcome::Locked => {
                self.last_known_usage = now;
                return false;
            }
            PurgeOutcome::UsedSince(ts) => {
                self.last_known_usage = ts;
                return false;
            }
        }

        let header = header_size();
        let payload = self.map.len().saturating_sub(header);
        if payload > 0 {
            // SAFETY: the client can no longer lock the region (the word
            // reads as purged), so nobody relies on the payload contents.
            // MADV_REMOVE frees the backing pages for every mapper.
            let advised = unsafe {
                self.map
                    .unchecked_advise_range(UncheckedAdvice::Remove, header, payload)
            };
            if let Err(e) = advised {
                tracing::warn!(error = %e, "madvise(MADV_REMOVE) failed; pages freed on release");
            }
        }
        self.last_known_usage = Timestamp::NULL;
        true
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn release(self) {
        // Dropping the map unmaps; dropping the file closes the descriptor.
        drop(self);
    }
}

/// Client-side mapping of a memfd region.
pub struct MemfdView {
    map: MmapMut,
}

impl MemfdView {
    /// Map a descriptor received from the host.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, BackendError> {
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len <= header_size() {
            return Err(BackendError::InvalidSize(len));
        }
        // SAFETY: the memfd is never truncated after creation.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { map })
    }

    pub fn state(&self) -> SharedState {
        SharedState::decode(lock_word(&self.map).load(std::sync::atomic::Ordering::Acquire))
    }
}

impl ClientView for MemfdView {
    fn lock(&mut self) -> LockResult {
        shared_state::try_lock(lock_word(&self.map))
    }

    fn unlock(&mut self, now: Timestamp) {
        if !shared_state::unlock(lock_word(&self.map), now) {
            tracing::trace!("unlock on a segment that is not locked");
        }
    }

    fn len(&self) -> usize {
        self.map.len() - header_size()
    }

    fn data(&self) -> &[u8] {
        &self.map[header_size()..]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let header = header_size();
        &mut self.map[header..]
    }
}

/// memfd-backed backend. Processes are identified by pid.
#[derive(Debug, Clone)]
pub struct MemfdBackend {
    name: CString,
}

impl MemfdBackend {
    pub fn new() -> Self {
        Self::with_name("discardable")
    }

    /// `name` shows up in `/proc/<pid>/fd/` as `memfd:<name>`.
    pub fn with_name(name: &str) -> Self {
        // Interior NULs are stripped, so construction cannot fail.
        let name = CString::new(name.replace('\0', "")).unwrap_or_default();
        Self { name }
    }
}

impl Default for MemfdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionBackend for MemfdBackend {
    type Region = MemfdRegion;
    type Process = Pid;
    type Shared = OwnedFd;
    type View = MemfdView;

    fn create_and_map(&self, size: usize, now: Timestamp) -> Result<MemfdRegion, BackendError> {
        if size == 0 {
            return Err(BackendError::InvalidSize(size));
        }
        let page = rustix::param::page_size();
        let payload = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(BackendError::InvalidSize(size))?;
        let total = payload
            .checked_add(header_size())
            .ok_or(BackendError::InvalidSize(size))?;

        let fd = rustix::fs::memfd_create(self.name.as_c_str(), rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(std::io::Error::from)?;
        rustix::fs::ftruncate(&fd, total as u64).map_err(std::io::Error::from)?;
        let file = File::from(fd);

        // SAFETY: the memfd was just created and sized by us; it is never
        // truncated afterwards.
        let map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
        lock_word(&map).store(SharedState::Locked.encode(), std::sync::atomic::Ordering::Release);

        Ok(MemfdRegion {
            map,
            file: Some(file),
            last_known_usage: now,
        })
    }

    fn share_to_process(&self, region: &MemfdRegion, target: &Pid) -> Result<OwnedFd, BackendError> {
        rustix::process::test_kill_process(*target)
            .map_err(|_| BackendError::ProcessNotFound(target.as_raw_nonzero().to_string()))?;
        let file = region
            .file
            .as_ref()
            .ok_or_else(|| BackendError::Io(std::io::Error::other("descriptor already closed")))?;
        Ok(OwnedFd::from(file.try_clone()?))
    }

    fn current_process(&self) -> Pid {
        rustix::process::getpid()
    }

    fn map_shared(&self, shared: OwnedFd) -> Result<MemfdView, BackendError> {
        MemfdView::from_fd(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_size_includes_header_page() {
        let backend = MemfdBackend::new();
        let region = backend.create_and_map(100, Timestamp(1)).unwrap();
        let page = rustix::param::page_size();
        assert_eq!(region.mapped_size(), 2 * page);
    }

    #[test]
    fn client_view_sees_host_pages() {
        let backend = MemfdBackend::new();
        let mut region = backend.create_and_map(4096, Timestamp(1)).unwrap();
        let fd = backend
            .share_to_process(&region, &backend.current_process())
            .unwrap();
        region.close();
        assert!(!region.is_open());

        let mut view = backend.map_shared(fd).unwrap();
        assert_eq!(view.state(), SharedState::Locked);
        view.data_mut()[0] = 0xAB;

        // Locked: purge refused and usage bumped.
        assert!(!region.purge(Timestamp(10)));
        assert_eq!(region.last_known_usage(), Timestamp(10));

        view.unlock(Timestamp(11));
        assert!(!region.purge(Timestamp(12)));
        assert!(region.purge(Timestamp(12)));
        assert_eq!(view.lock(), LockResult::Purged);

        view.unlock(Timestamp(13));
        assert_eq!(view.state(), SharedState::PURGED);
        assert_eq!(view.lock(), LockResult::Purged);
        region.release();
    }

    #[test]
    fn zero_size_is_rejected() {
        let backend = MemfdBackend::new();
        assert!(matches!(
            backend.create_and_map(0, Timestamp(1)),
            Err(BackendError::InvalidSize(0))
        ));
    }
}
