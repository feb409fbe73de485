// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for filament-core integration tests.
//!
//! Provides a recording recovery hook, failure-injecting and write-gating
//! stores, and helpers for starting runtimes and waiting on fiber state.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use filament_core::{
    EngineError, FiberEngine, FiberEventRecord, FiberRecord, FiberRuntime, FiberStatus,
    MemorySnapshotStore, OrphanedFiber, RecoveryDecision, RecoveryHook, SnapshotStore,
    StepRegistry,
};

/// What a scripted hook should answer for one orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedDecision {
    Restart,
    Leave,
    Fail,
}

/// Recovery hook that records every orphan it is handed and replays
/// scripted decisions in order, falling back to a default when the script
/// runs out.
pub struct RecordingHook {
    seen: Mutex<Vec<OrphanedFiber>>,
    script: Mutex<VecDeque<ScriptedDecision>>,
    fallback: ScriptedDecision,
}

impl RecordingHook {
    pub fn leave_all() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptedDecision::Leave,
        })
    }

    pub fn restart_all() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptedDecision::Restart,
        })
    }

    pub fn scripted(
        script: impl Into<VecDeque<ScriptedDecision>>,
        fallback: ScriptedDecision,
    ) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            fallback,
        })
    }

    /// Every orphan this hook has been handed, in order.
    pub fn seen(&self) -> Vec<OrphanedFiber> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.fiber_id.clone())
            .collect()
    }
}

#[async_trait]
impl RecoveryHook for RecordingHook {
    async fn decide(&self, orphan: &OrphanedFiber) -> anyhow::Result<RecoveryDecision> {
        self.seen.lock().unwrap().push(orphan.clone());
        let decision = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match decision {
            ScriptedDecision::Restart => Ok(RecoveryDecision::Restart),
            ScriptedDecision::Leave => Ok(RecoveryDecision::Leave),
            ScriptedDecision::Fail => Err(anyhow::anyhow!("scripted hook failure")),
        }
    }
}

/// Memory-backed store whose record writes can be made to fail on demand.
///
/// Reads and event inserts always succeed, so scans keep working while
/// writes are broken.
pub struct FailingStore {
    inner: MemorySnapshotStore,
    fail_puts: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySnapshotStore::new(),
            fail_puts: AtomicBool::new(false),
        })
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotStore for FailingStore {
    async fn put_fiber(&self, record: &FiberRecord) -> Result<(), EngineError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence {
                operation: "put_fiber".to_string(),
                details: "injected write failure".to_string(),
            });
        }
        self.inner.put_fiber(record).await
    }

    async fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, EngineError> {
        self.inner.get_fiber(fiber_id).await
    }

    async fn list_fibers(
        &self,
        status: Option<FiberStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberRecord>, EngineError> {
        self.inner.list_fibers(status, limit, offset).await
    }

    async fn list_fibers_by_status(
        &self,
        statuses: &[FiberStatus],
    ) -> Result<Vec<FiberRecord>, EngineError> {
        self.inner.list_fibers_by_status(statuses).await
    }

    async fn insert_event(&self, event: &FiberEventRecord) -> Result<(), EngineError> {
        self.inner.insert_event(event).await
    }

    async fn list_events(
        &self,
        fiber_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberEventRecord>, EngineError> {
        self.inner.list_events(fiber_id, limit, offset).await
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        self.inner.health_check().await
    }
}

/// Memory-backed store that can park one record write after it commits.
///
/// With a hold armed, the next `put_fiber` performs the write and signals
/// the waiter in `held`, then blocks until `release_put`. Reads pass
/// through, so a scan observes the committed record while its writer has
/// not yet returned.
pub struct GatedStore {
    inner: MemorySnapshotStore,
    hold_next_put: AtomicBool,
    held: Notify,
    resume: Notify,
}

impl GatedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySnapshotStore::new(),
            hold_next_put: AtomicBool::new(false),
            held: Notify::new(),
            resume: Notify::new(),
        })
    }

    /// Park the next `put_fiber` once its write has committed.
    pub fn hold_next_put(&self) {
        self.hold_next_put.store(true, Ordering::SeqCst);
    }

    /// Wait until a write is parked.
    pub async fn held(&self) {
        self.held.notified().await;
    }

    /// Let the parked write return.
    pub fn release_put(&self) {
        self.resume.notify_one();
    }
}

#[async_trait]
impl SnapshotStore for GatedStore {
    async fn put_fiber(&self, record: &FiberRecord) -> Result<(), EngineError> {
        self.inner.put_fiber(record).await?;
        if self.hold_next_put.swap(false, Ordering::SeqCst) {
            self.held.notify_one();
            self.resume.notified().await;
        }
        Ok(())
    }

    async fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, EngineError> {
        self.inner.get_fiber(fiber_id).await
    }

    async fn list_fibers(
        &self,
        status: Option<FiberStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberRecord>, EngineError> {
        self.inner.list_fibers(status, limit, offset).await
    }

    async fn list_fibers_by_status(
        &self,
        statuses: &[FiberStatus],
    ) -> Result<Vec<FiberRecord>, EngineError> {
        self.inner.list_fibers_by_status(statuses).await
    }

    async fn insert_event(&self, event: &FiberEventRecord) -> Result<(), EngineError> {
        self.inner.insert_event(event).await
    }

    async fn list_events(
        &self,
        fiber_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberEventRecord>, EngineError> {
        self.inner.list_events(fiber_id, limit, offset).await
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        self.inner.health_check().await
    }
}

/// Start a runtime with no background scanning, for deterministic tests.
pub async fn start_runtime(
    store: Arc<dyn SnapshotStore>,
    steps: StepRegistry,
    hook: Arc<dyn RecoveryHook>,
) -> FiberRuntime {
    FiberRuntime::builder()
        .store(store)
        .steps(steps)
        .recovery_hook(hook)
        .wake_driver(false)
        .recover_on_start(false)
        .build()
        .expect("Failed to build runtime")
        .start()
        .await
        .expect("Failed to start runtime")
}

/// An in-flight record as an eviction would have left it.
pub fn orphan_record(fiber_id: &str, step_name: &str, snapshot: Option<Value>) -> FiberRecord {
    let mut record = FiberRecord::new(fiber_id, step_name, json!({}));
    if snapshot.is_some() {
        record.snapshot = snapshot;
        record.status = FiberStatus::Checkpointed;
    }
    record
}

/// Poll until the fiber reaches `status`.
pub async fn wait_for_status(engine: &FiberEngine, fiber_id: &str, status: FiberStatus) {
    for _ in 0..1000 {
        if let Some(record) = engine.get_fiber(fiber_id).await.expect("get fiber")
            && record.status == status
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("fiber '{fiber_id}' never reached {status:?}");
}

/// Poll until the fiber settles, returning the final record.
pub async fn wait_for_terminal(engine: &FiberEngine, fiber_id: &str) -> FiberRecord {
    for _ in 0..1000 {
        if let Some(record) = engine.get_fiber(fiber_id).await.expect("get fiber")
            && record.status.is_terminal()
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("fiber '{fiber_id}' never settled");
}

/// Poll the store until the fiber's snapshot equals `expected`.
pub async fn wait_for_snapshot(store: &dyn SnapshotStore, fiber_id: &str, expected: &Value) {
    for _ in 0..1000 {
        if let Some(record) = store.get_fiber(fiber_id).await.expect("get fiber")
            && record.snapshot.as_ref() == Some(expected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("fiber '{fiber_id}' never stashed {expected}");
}
