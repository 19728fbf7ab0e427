//! Client identifiers and the client-to-process registry.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;

/// Identifier of a client process on whose behalf segments are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(pub i32);

impl ClientId {
    /// Sentinel for allocations made by the host for itself.
    pub const HOST: ClientId = ClientId(-1);

    pub fn is_host(&self) -> bool {
        *self == Self::HOST
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            f.write_str("host")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Segment identifier chosen by the client, unique per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves a client to a live process handle usable for sharing.
pub trait ProcessRegistry<P>: Send + Sync {
    /// Returns `None` when the client is unknown or its process is gone.
    fn resolve(&self, client: ClientId) -> Option<P>;
}

/// Map-backed registry filled in by the IPC layer as clients connect.
pub struct ClientProcesses<P> {
    processes: RwLock<HashMap<ClientId, P>>,
}

impl<P: Clone + Send + Sync> ClientProcesses<P> {
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the process handle for a client.
    pub fn register(&self, client: ClientId, process: P) {
        self.processes.write().insert(client, process);
    }

    /// Forget a client. Returns the handle it had, if any.
    pub fn unregister(&self, client: ClientId) -> Option<P> {
        self.processes.write().remove(&client)
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }
}

impl<P: Clone + Send + Sync> Default for ClientProcesses<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone + Send + Sync> ProcessRegistry<P> for ClientProcesses<P> {
    fn resolve(&self, client: ClientId) -> Option<P> {
        self.processes.read().get(&client).cloned()
    }
}
