//! Discardable shared-memory host.
//!
//! Hands out shared-memory segments to client processes, keeps the bytes
//! mapped across all of them under a global budget, and purges the least
//! recently used unlocked segments when the budget is exceeded or the system
//! reports memory pressure.
//!
//! # Segment lifecycle
//!
//! - Allocated locked, shared to the client's process.
//! - The client unlocks it when idle and relocks before use; a relock fails
//!   once the host has purged the contents.
//! - The host deletes it on request, when the client goes away, or when
//!   eviction purges it.
//!
//! # Ownership
//!
//! No globals: the embedder owns a [`DiscardableMemoryManager`] (or a
//! [`Host`], which also runs the pressure listener) and shares it via `Arc`.

pub mod config;
pub mod error;
pub mod memory;
pub mod pressure;
pub mod process;
pub mod telemetry;

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::HostConfig;
pub use error::{BackendError, DiscardableError, Result};
pub use memory::{
    DiscardableMemory, DiscardableMemoryManager, EvictionReport, InProcessBackend, ManagerConfig,
    MemoryDump, RegionBackend,
};
#[cfg(target_os = "linux")]
pub use memory::MemfdBackend;
pub use pressure::{MemoryPressureLevel, MemoryPressureNotifier};
pub use process::{ClientId, ClientProcesses, ProcessRegistry, SegmentId};

/// A manager wired to a pressure listener.
pub struct Host<B: RegionBackend> {
    pub manager: Arc<DiscardableMemoryManager<B>>,
    pub pressure: MemoryPressureNotifier,
    listener: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl<B: RegionBackend> Host<B> {
    /// Build the manager on `runtime` and start the pressure listener there.
    pub fn new(mut config: HostConfig, backend: B, runtime: &Handle) -> Self {
        config.manager.runtime = Some(runtime.clone());
        let manager = Arc::new(DiscardableMemoryManager::new(config.manager, backend));
        let pressure = MemoryPressureNotifier::new();
        let shutdown = CancellationToken::new();

        let listener = {
            let _guard = runtime.enter();
            pressure::spawn_pressure_listener(
                Arc::clone(&manager),
                pressure.subscribe(),
                shutdown.clone(),
            )
        };

        tracing::info!(
            memory_limit = manager.memory_limit(),
            low_end_device = config.low_end_device,
            "Discardable memory host started"
        );

        Self {
            manager,
            pressure,
            listener: Some(listener),
            shutdown,
        }
    }

    /// Stop the pressure listener and wait for it to exit.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
    }
}

impl<B: RegionBackend> Drop for Host<B> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
