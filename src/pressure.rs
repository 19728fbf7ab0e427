//! Memory pressure bridge.
//!
//! A platform monitor publishes levels on a `watch` channel; a listener task
//! forwards each signal to the manager until shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::memory::{DiscardableMemoryManager, RegionBackend};

/// System memory pressure level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MemoryPressureLevel {
    #[default]
    None,
    /// Evict down to half the budget.
    Moderate,
    /// Evict everything unlocked.
    Critical,
}

impl MemoryPressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Moderate => "moderate",
            Self::Critical => "critical",
        }
    }
}

/// Publishing side of the pressure channel.
#[derive(Debug)]
pub struct MemoryPressureNotifier {
    tx: watch::Sender<MemoryPressureLevel>,
}

impl MemoryPressureNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(MemoryPressureLevel::None);
        Self { tx }
    }

    /// Publish a level. Every call wakes listeners, even for a repeated
    /// level; signals sent faster than listeners run coalesce to the latest.
    pub fn notify(&self, level: MemoryPressureLevel) {
        self.tx.send_replace(level);
    }

    pub fn subscribe(&self) -> watch::Receiver<MemoryPressureLevel> {
        self.tx.subscribe()
    }

    /// Most recently published level.
    pub fn current(&self) -> MemoryPressureLevel {
        *self.tx.borrow()
    }
}

impl Default for MemoryPressureNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the listener loop. Returns a handle for shutdown.
pub fn spawn_pressure_listener<B: RegionBackend>(
    manager: Arc<DiscardableMemoryManager<B>>,
    rx: watch::Receiver<MemoryPressureLevel>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        pressure_loop(&manager, rx, shutdown).await;
    })
}

async fn pressure_loop<B: RegionBackend>(
    manager: &DiscardableMemoryManager<B>,
    mut rx: watch::Receiver<MemoryPressureLevel>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("pressure listener: shutdown signal received");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    tracing::debug!("pressure listener: notifier dropped");
                    break;
                }
                let level = *rx.borrow_and_update();
                if level != MemoryPressureLevel::None {
                    let report = manager.on_memory_pressure(level);
                    tracing::debug!(
                        level = level.as_str(),
                        segments = report.segments,
                        bytes = report.bytes,
                        "pressure listener: purged"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_have_stable_labels() {
        assert_eq!(MemoryPressureLevel::None.as_str(), "none");
        assert_eq!(MemoryPressureLevel::Moderate.as_str(), "moderate");
        assert_eq!(MemoryPressureLevel::Critical.as_str(), "critical");
    }

    #[test]
    fn subscriber_waits_until_publish() {
        let notifier = MemoryPressureNotifier::new();
        let mut rx = notifier.subscribe();
        let mut changed = tokio_test::task::spawn(async move { rx.changed().await.is_ok() });

        tokio_test::assert_pending!(changed.poll());
        notifier.notify(MemoryPressureLevel::Moderate);
        assert!(changed.is_woken());
        assert!(tokio_test::assert_ready!(changed.poll()));
    }

    #[tokio::test]
    async fn repeated_level_wakes_subscriber() {
        let notifier = MemoryPressureNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.notify(MemoryPressureLevel::Critical);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), MemoryPressureLevel::Critical);

        notifier.notify(MemoryPressureLevel::Critical);
        assert!(rx.has_changed().unwrap());
        assert_eq!(notifier.current(), MemoryPressureLevel::Critical);
    }
}
