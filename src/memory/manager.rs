// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Host-side manager for discardable shared-memory segments.
//!
//! Tracks every segment handed out to every client, keeps the sum of their
//! mapped sizes under a byte budget, and evicts the least recently used
//! unlocked segments when the budget is exceeded or memory pressure is
//! signalled.
//!
//! All bookkeeping sits behind one `parking_lot::Mutex`. Creating, mapping
//! and sharing a region happen outside it; the duplicate-id check is
//! repeated when the lock is taken again to register the segment.
//!
//! When an allocation leaves usage over budget, one deferred enforcement
//! pass is scheduled on the tokio runtime after `enforce_delay`. Further
//! over-budget allocations inside that window do not schedule more passes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use slab::Slab;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config;
use crate::error::{DiscardableError, Result};
use crate::pressure::MemoryPressureLevel;
use crate::process::{ClientId, ProcessRegistry, SegmentId};
use crate::telemetry::{self, AllocationSpan, SpanExt};

use super::backend::{DiscardableRegion, RegionBackend};
use super::clock::{Clock, SystemClock};
use super::dump::{MemoryDump, SegmentDump};
use super::eviction::EvictionOrder;
use super::handle::DiscardableMemory;
use super::registry::ClientRegistry;
use super::segment::Segment;

/// Default delay before a deferred enforcement pass.
pub const ENFORCE_MEMORY_POLICY_DELAY_MS: u64 = 1000;

/// Callback invoked with the new total whenever it changes.
///
/// Runs while the manager lock is held: it must not call back into the
/// manager.
pub type BytesAllocatedObserver = Box<dyn Fn(usize) + Send + Sync>;

/// Configuration for the segment manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Byte budget across all live segments.
    pub memory_limit: usize,
    /// Delay before a deferred enforcement pass.
    pub enforce_delay_ms: u64,
    /// Runtime for deferred enforcement. Falls back to the runtime the
    /// manager is constructed on, if any.
    #[serde(skip)]
    pub runtime: Option<Handle>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            memory_limit: config::default_memory_limit(false),
            enforce_delay_ms: ENFORCE_MEMORY_POLICY_DELAY_MS,
            runtime: None,
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub segments: usize,
    pub bytes: usize,
    /// Whether usage ended at or below the target.
    pub within_limit: bool,
}

pub(crate) struct State<R: DiscardableRegion> {
    segments: Slab<Segment<R>>,
    registry: ClientRegistry,
    order: EvictionOrder,
    bytes_allocated: usize,
    memory_limit: usize,
    enforce_pending: bool,
    enforce_task: Option<JoinHandle<()>>,
    /// Bumped on every schedule and cancel. A deferred task whose
    /// generation no longer matches is stale and does nothing.
    enforce_generation: u64,
}

impl<R: DiscardableRegion> State<R> {
    fn new(memory_limit: usize) -> Self {
        Self {
            segments: Slab::new(),
            registry: ClientRegistry::new(),
            order: EvictionOrder::new(),
            bytes_allocated: 0,
            memory_limit,
            enforce_pending: false,
            enforce_task: None,
            enforce_generation: 0,
        }
    }

    /// Abort the pending deferred pass, if any.
    fn cancel_deferred_enforcement(&mut self) {
        self.enforce_pending = false;
        self.enforce_generation = self.enforce_generation.wrapping_add(1);
        if let Some(task) = self.enforce_task.take() {
            task.abort();
        }
    }

    /// Take a segment out of the arena, registry and eviction order.
    fn unlink(&mut self, key: usize) -> Segment<R> {
        let segment = self.segments.remove(key);
        self.order.remove(segment.queued_at(), key);
        segment
    }

    fn subtract(&mut self, size: usize) {
        assert!(
            self.bytes_allocated >= size,
            "allocated byte counter underflow: {} - {}",
            self.bytes_allocated,
            size
        );
        self.bytes_allocated -= size;
    }
}

pub(crate) struct Inner<B: RegionBackend> {
    backend: B,
    clock: Arc<dyn Clock>,
    state: Mutex<State<B::Region>>,
    observers: RwLock<Vec<BytesAllocatedObserver>>,
    next_local_id: AtomicU32,
    enforce_delay: Duration,
    runtime: Option<Handle>,
}

impl<B: RegionBackend> Inner<B> {
    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn allocate(
        self: &Arc<Self>,
        process: &B::Process,
        client: ClientId,
        size: usize,
        id: SegmentId,
    ) -> Result<B::Shared> {
        {
            let mut state = self.state.lock();

            if state.registry.contains(client, id) {
                tracing::error!(%client, segment_id = id.0, "Invalid discardable shared memory ID");
                return Err(DiscardableError::DuplicateIdentifier { client, id });
            }

            // Make room so that adding `size` does not take usage above the
            // limit. The mapped size can still come out larger than `size`.
            let limit = state.memory_limit.saturating_sub(size);
            if state.bytes_allocated > limit {
                self.reduce_until_within_limit(&mut state, limit);
            }
        }

        let now = self.clock.now();
        let mut region = self.backend.create_and_map(size, now).map_err(|source| {
            tracing::warn!(%client, size, error = %source, "Cannot create discardable memory segment");
            DiscardableError::MappingFailed { size, source }
        })?;

        let shared = match self.backend.share_to_process(&region, process) {
            Ok(shared) => shared,
            Err(source) => {
                tracing::error!(%client, error = %source, "Cannot share discardable memory segment");
                region.release();
                return Err(DiscardableError::SharingFailed { client, source });
            }
        };

        let mapped_size = region.mapped_size();
        Span::current().record("mapped_bytes", mapped_size);

        let mut state = self.state.lock();

        // Another caller may have registered the same id while we were
        // mapping.
        if state.registry.contains(client, id) {
            tracing::error!(%client, segment_id = id.0, "Invalid discardable shared memory ID");
            region.release();
            return Err(DiscardableError::DuplicateIdentifier { client, id });
        }

        let Some(total) = state.bytes_allocated.checked_add(mapped_size) else {
            tracing::error!(
                current = state.bytes_allocated,
                mapped_size,
                "Discardable byte counter overflow"
            );
            let current = state.bytes_allocated;
            region.release();
            return Err(DiscardableError::CounterOverflow {
                current,
                requested: mapped_size,
            });
        };
        state.bytes_allocated = total;
        self.bytes_allocated_changed(total);

        // Close the descriptor to avoid running out; the mapping stays.
        region.close();

        let segment = Segment::new(client, id, region);
        let queued_at = segment.queued_at();
        let key = state.segments.insert(segment);
        state.registry.insert(client, id, key);
        state.order.insert(queued_at, key);

        tracing::debug!(%client, segment_id = id.0, mapped_size, total, "Allocated discardable segment");

        if state.bytes_allocated > state.memory_limit {
            self.schedule_enforce_memory_policy(&mut state);
        }

        Ok(shared)
    }

    /// Delete without logging. Used by the public path and by dropped
    /// host-local handles, which treat an evicted segment as already gone.
    pub(crate) fn delete_segment(&self, client: ClientId, id: SegmentId) -> Result<()> {
        let mut state = self.state.lock();

        let key = state
            .registry
            .remove(client, id)
            .ok_or(DiscardableError::NotFound { client, id })?;

        let before = state.bytes_allocated;
        let segment = state.unlink(key);
        state.subtract(segment.mapped_size());
        segment.release();

        if state.bytes_allocated != before {
            self.bytes_allocated_changed(state.bytes_allocated);
        }
        Ok(())
    }

    fn remove_client(&self, client: ClientId) -> usize {
        let mut state = self.state.lock();

        let Some(keys) = state.registry.remove_client(client) else {
            return 0;
        };

        let before = state.bytes_allocated;
        let count = keys.len();
        for key in keys {
            let segment = state.unlink(key);
            state.subtract(segment.mapped_size());
            segment.release();
        }

        if state.bytes_allocated != before {
            self.bytes_allocated_changed(state.bytes_allocated);
        }
        tracing::debug!(%client, count, freed = before - state.bytes_allocated, "Released client segments");
        count
    }

    fn set_memory_limit(self: &Arc<Self>, limit: usize) {
        let limit = limit.max(1);
        let mut state = self.state.lock();
        state.memory_limit = limit;
        telemetry::record_memory_limit(limit);

        if state.bytes_allocated <= limit {
            return;
        }
        let report = self.reduce_until_within_limit(&mut state, limit);
        if !report.within_limit {
            self.schedule_enforce_memory_policy(&mut state);
        }
    }

    /// Explicit pass. Replaces any pending deferred pass.
    fn enforce_memory_policy(&self) -> EvictionReport {
        let mut state = self.state.lock();
        state.cancel_deferred_enforcement();
        self.enforce_locked(&mut state)
    }

    /// Body of the deferred task. The task owns the handle in the slot, so
    /// it only clears it.
    fn run_deferred_enforcement(&self, generation: u64) {
        let mut state = self.state.lock();
        if !state.enforce_pending || state.enforce_generation != generation {
            tracing::trace!(generation, "Stale discardable memory enforcement skipped");
            return;
        }
        state.enforce_pending = false;
        state.enforce_task = None;
        self.enforce_locked(&mut state);
    }

    fn enforce_locked(&self, state: &mut State<B::Region>) -> EvictionReport {
        telemetry::record_enforcement_pass();

        let limit = state.memory_limit;
        let report = self.reduce_until_within_limit(state, limit);
        if !report.within_limit {
            // Remaining segments are locked. The next allocation or pressure
            // signal retries.
            tracing::debug!(
                bytes_allocated = state.bytes_allocated,
                limit,
                "Still over discardable memory budget after enforcement"
            );
        }
        report
    }

    fn on_memory_pressure(&self, level: MemoryPressureLevel) -> EvictionReport {
        telemetry::record_pressure_signal(level.as_str());
        let mut state = self.state.lock();

        let limit = match level {
            MemoryPressureLevel::None => {
                return EvictionReport {
                    within_limit: state.bytes_allocated <= state.memory_limit,
                    ..EvictionReport::default()
                };
            }
            MemoryPressureLevel::Moderate => state.memory_limit / 2,
            MemoryPressureLevel::Critical => 0,
        };
        tracing::info!(level = level.as_str(), limit, "Memory pressure; purging discardable memory");
        self.reduce_until_within_limit(&mut state, limit)
    }

    fn reduce_until_within_limit(
        &self,
        state: &mut State<B::Region>,
        limit: usize,
    ) -> EvictionReport {
        let _span = tracing::trace_span!(
            "reduce_discardable_memory",
            bytes_allocated = state.bytes_allocated,
            limit
        )
        .entered();

        // Locked segments get their usage time bumped to `now`; meeting one
        // again in this pass means everything left is in use.
        let now = self.clock.now();
        let before = state.bytes_allocated;
        let mut evicted = 0;

        while state.bytes_allocated > limit {
            let Some((last_used, key)) = state.order.peek() else {
                break;
            };
            if last_used >= now {
                break;
            }
            state.order.pop();

            if state.segments[key].purge(now) {
                let segment = state.segments.remove(key);
                state.registry.remove(segment.client(), segment.id());
                let size = segment.mapped_size();
                state.subtract(size);
                tracing::debug!(
                    client = %segment.client(),
                    segment_id = segment.id().0,
                    size,
                    "Purged discardable segment"
                );
                segment.release();
                evicted += 1;
                continue;
            }

            // Back on the queue with its refreshed usage time.
            let queued_at = state.segments[key].requeue();
            state.order.insert(queued_at, key);
        }

        let freed = before - state.bytes_allocated;
        if freed > 0 {
            telemetry::record_eviction(evicted, freed);
            self.bytes_allocated_changed(state.bytes_allocated);
        }

        EvictionReport {
            segments: evicted,
            bytes: freed,
            within_limit: state.bytes_allocated <= limit,
        }
    }

    fn schedule_enforce_memory_policy(self: &Arc<Self>, state: &mut State<B::Region>) {
        if state.enforce_pending {
            return;
        }

        let Some(runtime) = self.runtime.as_ref() else {
            tracing::warn!(
                bytes_allocated = state.bytes_allocated,
                limit = state.memory_limit,
                "Over discardable memory budget with no runtime for deferred enforcement"
            );
            return;
        };

        state.enforce_pending = true;
        state.enforce_generation = state.enforce_generation.wrapping_add(1);
        let generation = state.enforce_generation;
        let inner = Arc::clone(self);
        let delay = self.enforce_delay;
        tracing::trace!(delay_ms = delay.as_millis() as u64, "Scheduling discardable memory enforcement");
        state.enforce_task = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.run_deferred_enforcement(generation);
        }));
    }

    fn bytes_allocated_changed(&self, bytes: usize) {
        tracing::trace!(bytes, "TotalDiscardableMemoryUsage");
        telemetry::record_bytes_allocated(bytes);
        for observer in self.observers.read().iter() {
            observer(bytes);
        }
    }
}

/// Budgeted registry of discardable segments for all clients.
///
/// Construct one per host and share it behind an `Arc`. Dropping it cancels
/// a pending deferred enforcement pass.
pub struct DiscardableMemoryManager<B: RegionBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: RegionBackend> DiscardableMemoryManager<B> {
    pub fn new(config: ManagerConfig, backend: B) -> Self {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ManagerConfig, backend: B, clock: Arc<dyn Clock>) -> Self {
        let runtime = config.runtime.or_else(|| Handle::try_current().ok());
        let memory_limit = config.memory_limit.max(1);
        telemetry::record_memory_limit(memory_limit);

        Self {
            inner: Arc::new(Inner {
                backend,
                clock,
                state: Mutex::new(State::new(memory_limit)),
                observers: RwLock::new(Vec::new()),
                next_local_id: AtomicU32::new(0),
                enforce_delay: Duration::from_millis(config.enforce_delay_ms.max(1)),
                runtime,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Allocate a locked segment for `client` and share it with `process`.
    ///
    /// Evicts least recently used unlocked segments first so the new one
    /// fits. Fails without side effects on a duplicate id or a backend
    /// failure.
    pub fn allocate_locked_segment(
        &self,
        process: &B::Process,
        client: ClientId,
        size: usize,
        id: SegmentId,
    ) -> Result<B::Shared> {
        let span = AllocationSpan::new(client, id, size);
        let result = span.in_scope(|| self.inner.allocate(process, client, size, id));
        span.record_result(&result);
        if let Err(e) = &result {
            telemetry::record_allocation_failure(e.kind());
        }
        result
    }

    /// Resolve the client's process through `registry`, then allocate.
    pub fn allocate_for_client<R>(
        &self,
        registry: &R,
        client: ClientId,
        size: usize,
        id: SegmentId,
    ) -> Result<B::Shared>
    where
        R: ProcessRegistry<B::Process> + ?Sized,
    {
        let Some(process) = registry.resolve(client) else {
            tracing::warn!(%client, "Allocation for client without a live process");
            telemetry::record_allocation_failure("process_gone");
            return Err(DiscardableError::ProcessGone(client));
        };
        self.allocate_locked_segment(&process, client, size, id)
    }

    /// Allocate a segment for the host itself and map it locally.
    pub fn allocate_locked_discardable_memory(&self, size: usize) -> Result<DiscardableMemory<B>> {
        let id = SegmentId(self.inner.next_local_id.fetch_add(1, Ordering::Relaxed));
        let process = self.inner.backend.current_process();
        let shared = self.allocate_locked_segment(&process, ClientId::HOST, size, id)?;

        match self.inner.backend.map_shared(shared) {
            Ok(view) => Ok(DiscardableMemory::new(view, id, Arc::clone(&self.inner))),
            Err(source) => {
                tracing::warn!(size, error = %source, "Cannot map host-local discardable segment");
                match self.inner.delete_segment(ClientId::HOST, id) {
                    Ok(()) => {}
                    Err(DiscardableError::NotFound { .. }) => {
                        tracing::trace!(segment_id = id.0, "Host-local segment already evicted");
                    }
                    Err(e) => {
                        tracing::warn!(segment_id = id.0, error = %e, "Failed to roll back host-local segment");
                    }
                }
                Err(DiscardableError::MappingFailed { size, source })
            }
        }
    }

    /// Delete one segment. Unknown `(client, id)` is an error.
    pub fn delete_segment(&self, client: ClientId, id: SegmentId) -> Result<()> {
        let result = self.inner.delete_segment(client, id);
        if result.is_err() {
            tracing::error!(%client, segment_id = id.0, "Invalid discardable shared memory ID");
        }
        result
    }

    /// Release every segment a client owns. Returns how many were released.
    pub fn remove_client(&self, client: ClientId) -> usize {
        self.inner.remove_client(client)
    }

    /// Set the budget and evict down to it right away. Floored at 1 byte.
    pub fn set_memory_limit(&self, limit: usize) {
        self.inner.set_memory_limit(limit);
    }

    pub fn memory_limit(&self) -> usize {
        self.inner.state.lock().memory_limit
    }

    /// Run an eviction pass against the budget now. Cancels a pending
    /// deferred pass and never schedules a new one.
    pub fn enforce_policy(&self) -> EvictionReport {
        self.inner.enforce_memory_policy()
    }

    pub fn enforcement_pending(&self) -> bool {
        self.inner.state.lock().enforce_pending
    }

    pub fn on_memory_pressure(&self, level: MemoryPressureLevel) -> EvictionReport {
        self.inner.on_memory_pressure(level)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.inner.state.lock().bytes_allocated
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().segments.len()
    }

    pub fn client_segment_count(&self, client: ClientId) -> usize {
        self.inner.state.lock().registry.segment_count(client)
    }

    pub fn contains(&self, client: ClientId, id: SegmentId) -> bool {
        self.inner.state.lock().registry.contains(client, id)
    }

    /// Observe changes to the allocated byte total.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.inner.observers.write().push(Box::new(observer));
    }

    /// Per-segment snapshot for diagnostics.
    pub fn memory_dump(&self) -> MemoryDump {
        let state = self.inner.state.lock();
        let mut segments: Vec<SegmentDump> = state
            .registry
            .iter()
            .map(|(client, id, key)| {
                let segment = &state.segments[key];
                SegmentDump::new(client, id, segment.mapped_size(), segment.last_used())
            })
            .collect();
        segments.sort_by_key(|s| (s.client, s.segment_id));

        MemoryDump {
            bytes_allocated: state.bytes_allocated,
            memory_limit: state.memory_limit,
            segments,
        }
    }
}

impl<B: RegionBackend> Drop for DiscardableMemoryManager<B> {
    fn drop(&mut self) {
        self.inner.state.lock().cancel_deferred_enforcement();
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
