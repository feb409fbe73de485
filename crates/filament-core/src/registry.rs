// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process bookkeeping for fiber records and live runners.
//!
//! The registry is the authority on "does this fiber have a runner in this
//! process". Claims are taken synchronously under one lock, so two
//! concurrent spawn or restart calls for the same fiber cannot both win.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::fiber::FiberRecord;

/// One claimed runner. `handle` is `None` between claim and task spawn.
struct RunnerSlot {
    handle: Option<JoinHandle<()>>,
}

impl RunnerSlot {
    fn is_active(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            None => true,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<String, FiberRecord>,
    runners: HashMap<String, RunnerSlot>,
    reported: HashSet<String>,
}

/// Shared in-process registry of fiber state.
///
/// `records` caches the latest known record per fiber so reads do not have
/// to hit storage. `reported` remembers which orphans were already handed
/// to the recovery hook during this process lifetime.
#[derive(Default)]
pub(crate) struct FiberRegistry {
    inner: Mutex<RegistryInner>,
}

impl FiberRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the runner slot for a fiber.
    ///
    /// Fails with `AlreadyRunning` while a previous claim is still active.
    /// A successful claim clears the orphan-reported flag, so the fiber can
    /// be reported again if this new runner is itself orphaned later.
    pub(crate) fn claim(&self, fiber_id: &str) -> Result<(), EngineError> {
        let mut inner = self.locked();
        if let Some(slot) = inner.runners.get(fiber_id)
            && slot.is_active()
        {
            return Err(EngineError::AlreadyRunning {
                fiber_id: fiber_id.to_string(),
            });
        }
        inner
            .runners
            .insert(fiber_id.to_string(), RunnerSlot { handle: None });
        inner.reported.remove(fiber_id);
        Ok(())
    }

    /// Attach the spawned task to an existing claim.
    ///
    /// If the claim is gone (runner finished or shutdown aborted it before
    /// the handle arrived) the handle is dropped rather than resurrecting
    /// the slot.
    pub(crate) fn attach(&self, fiber_id: &str, handle: JoinHandle<()>) {
        let mut inner = self.locked();
        if let Some(slot) = inner.runners.get_mut(fiber_id) {
            slot.handle = Some(handle);
        }
    }

    /// Release the runner slot, making the fiber claimable again.
    pub(crate) fn release(&self, fiber_id: &str) {
        self.locked().runners.remove(fiber_id);
    }

    pub(crate) fn has_active_runner(&self, fiber_id: &str) -> bool {
        self.locked()
            .runners
            .get(fiber_id)
            .is_some_and(RunnerSlot::is_active)
    }

    /// Number of fibers with an active runner in this process.
    pub(crate) fn active_count(&self) -> usize {
        self.locked()
            .runners
            .values()
            .filter(|slot| slot.is_active())
            .count()
    }

    /// Cache the latest known record for a fiber.
    pub(crate) fn upsert_record(&self, record: &FiberRecord) {
        self.locked()
            .records
            .insert(record.fiber_id.clone(), record.clone());
    }

    pub(crate) fn get_record(&self, fiber_id: &str) -> Option<FiberRecord> {
        self.locked().records.get(fiber_id).cloned()
    }

    /// Drop a settled fiber's cached record and reported flag.
    ///
    /// Terminal records are served from storage, so the cache only ever
    /// holds in-flight fibers. The runner slot is released separately.
    pub(crate) fn retire(&self, fiber_id: &str) {
        let mut inner = self.locked();
        inner.records.remove(fiber_id);
        inner.reported.remove(fiber_id);
    }

    /// Merge records loaded from storage into the cache.
    ///
    /// Entries with an active runner are skipped: the runner's own writes
    /// are fresher than whatever the storage scan returned.
    pub(crate) fn reconcile(&self, records: &[FiberRecord]) {
        let mut inner = self.locked();
        for record in records {
            let active = inner
                .runners
                .get(&record.fiber_id)
                .is_some_and(RunnerSlot::is_active);
            if !active {
                inner
                    .records
                    .insert(record.fiber_id.clone(), record.clone());
            }
        }
    }

    /// Remember that this orphan was already handed to the recovery hook.
    pub(crate) fn mark_reported(&self, fiber_id: &str) {
        self.locked().reported.insert(fiber_id.to_string());
    }

    pub(crate) fn was_reported(&self, fiber_id: &str) -> bool {
        self.locked().reported.contains(fiber_id)
    }

    /// Abort every live runner task. Returns how many were aborted.
    pub(crate) fn abort_all(&self) -> usize {
        let mut inner = self.locked();
        let mut aborted = 0;
        for (_, slot) in inner.runners.drain() {
            if let Some(handle) = slot.handle
                && !handle.is_finished()
            {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_until_released(registry: &FiberRegistry, fiber_id: &str) {
        for _ in 0..200 {
            if !registry.has_active_runner(fiber_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("runner for '{fiber_id}' never finished");
    }

    #[test]
    fn test_claim_blocks_second_claim() {
        let registry = FiberRegistry::new();

        registry.claim("fib-1").expect("first claim");
        let err = registry.claim("fib-1").expect_err("second claim must fail");
        assert_eq!(err.error_code(), "ALREADY_RUNNING");

        registry.release("fib-1");
        registry.claim("fib-1").expect("claim after release");
    }

    #[tokio::test]
    async fn test_claim_succeeds_after_runner_finishes() {
        let registry = FiberRegistry::new();
        let (tx, rx) = oneshot::channel::<()>();

        registry.claim("fib-1").expect("claim");
        let handle = tokio::spawn(async move {
            rx.await.ok();
        });
        registry.attach("fib-1", handle);

        assert!(registry.has_active_runner("fib-1"));
        assert!(registry.claim("fib-1").is_err());

        tx.send(()).expect("send");
        wait_until_released(&registry, "fib-1").await;

        registry.claim("fib-1").expect("claim after finish");
    }

    #[test]
    fn test_claim_clears_reported_flag() {
        let registry = FiberRegistry::new();

        registry.mark_reported("fib-1");
        assert!(registry.was_reported("fib-1"));

        registry.claim("fib-1").expect("claim");
        assert!(!registry.was_reported("fib-1"));
    }

    #[tokio::test]
    async fn test_attach_without_claim_drops_handle() {
        let registry = FiberRegistry::new();

        registry.attach("fib-1", tokio::spawn(async {}));
        assert!(!registry.has_active_runner("fib-1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_retire_drops_record_and_reported_flag() {
        let registry = FiberRegistry::new();

        registry.claim("fib-1").expect("claim");
        registry.upsert_record(&FiberRecord::new("fib-1", "noop", json!({})));
        registry.mark_reported("fib-1");

        registry.retire("fib-1");
        assert!(registry.get_record("fib-1").is_none());
        assert!(!registry.was_reported("fib-1"));
        // The claim outlives retirement until the runner releases it.
        assert!(registry.has_active_runner("fib-1"));

        registry.release("fib-1");
        assert!(!registry.has_active_runner("fib-1"));
    }

    #[test]
    fn test_reconcile_skips_fibers_with_active_runner() {
        let registry = FiberRegistry::new();

        let mut local = FiberRecord::new("fib-1", "noop", json!({"fresh": true}));
        local.snapshot = Some(json!({"stage": 3}));
        registry.upsert_record(&local);
        registry.claim("fib-1").expect("claim");

        let stale = FiberRecord::new("fib-1", "noop", json!({"fresh": false}));
        let unseen = FiberRecord::new("fib-2", "noop", json!({}));
        registry.reconcile(&[stale, unseen]);

        let cached = registry.get_record("fib-1").expect("cached");
        assert_eq!(cached.snapshot, Some(json!({"stage": 3})));
        assert!(registry.get_record("fib-2").is_some());
    }

    #[tokio::test]
    async fn test_abort_all_clears_runners() {
        let registry = FiberRegistry::new();

        registry.claim("fib-1").expect("claim");
        registry.attach("fib-1", tokio::spawn(std::future::pending::<()>()));
        registry.claim("fib-2").expect("claim");
        registry.attach("fib-2", tokio::spawn(std::future::pending::<()>()));

        assert_eq!(registry.active_count(), 2);
        let aborted = registry.abort_all();
        assert_eq!(aborted, 2);
        assert_eq!(registry.active_count(), 0);

        registry.claim("fib-1").expect("claim after abort");
    }
}
