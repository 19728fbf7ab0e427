//! Discardable shared-memory segments and their budget.
//!
//! Backends create and share regions; the manager keeps their total under a
//! byte budget by purging unlocked segments least recently used first.

mod backend;
mod clock;
mod dump;
mod eviction;
mod handle;
mod in_process;
mod manager;
#[cfg(target_os = "linux")]
mod memfd;
mod registry;
mod segment;
mod shared_state;

pub use backend::{ClientView, DiscardableRegion, RegionBackend};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use dump::{dump_name, segment_guid, MemoryDump, SegmentDump};
pub use handle::DiscardableMemory;
pub use in_process::{
    InProcessBackend, InProcessRegion, InProcessShared, InProcessView, CURRENT_PROCESS,
};
pub use manager::{
    BytesAllocatedObserver, DiscardableMemoryManager, EvictionReport, ManagerConfig,
    ENFORCE_MEMORY_POLICY_DELAY_MS,
};
#[cfg(target_os = "linux")]
pub use memfd::{MemfdBackend, MemfdRegion, MemfdView};
pub use shared_state::{LockResult, PurgeOutcome, SharedState};
