// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fiber lifecycle operations: spawn, restart, abandon, inspect, recover.
//!
//! The engine is the single writer of fiber records. Every transition goes
//! through here (or through [`StepContext::stash`](crate::runner::StepContext::stash),
//! which shares the same state), so the at-most-one-runner rule can be
//! enforced in one place: a synchronous claim in the in-process registry,
//! taken before any await point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::fiber::{FiberEventKind, FiberEventRecord, FiberRecord, FiberStatus};
use crate::persistence::SnapshotStore;
use crate::recovery::{self, RecoveryHook, RecoveryReport, WakeController};
use crate::registry::FiberRegistry;
use crate::runner::{StepContext, drive_fiber};
use crate::steps::StepRegistry;

/// State shared by the engine, its runners, and the recovery scheduler.
pub(crate) struct EngineShared {
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) registry: FiberRegistry,
    pub(crate) steps: StepRegistry,
    pub(crate) hook: Arc<dyn RecoveryHook>,
    pub(crate) wake: WakeController,
    pub(crate) wake_delay: Duration,
    /// Serializes recovery scans; a scan must never observe another scan's
    /// half-processed orphan set.
    pub(crate) scan_lock: Mutex<()>,
}

/// Handle for spawning and managing fibers.
///
/// Cheap to clone; every clone shares the same registry, snapshot store,
/// and wake timer.
#[derive(Clone)]
pub struct FiberEngine {
    shared: Arc<EngineShared>,
}

impl FiberEngine {
    pub(crate) fn new(
        store: Arc<dyn SnapshotStore>,
        steps: StepRegistry,
        hook: Arc<dyn RecoveryHook>,
        wake_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                store,
                registry: FiberRegistry::new(),
                steps,
                hook,
                wake: WakeController::new(),
                wake_delay,
                scan_lock: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Spawn a new fiber executing the step registered under `step_name`.
    ///
    /// The record is durably written before the runner starts, so a crash
    /// immediately after spawn still leaves a recoverable fiber. Returns the
    /// new fiber id; execution proceeds in a background task.
    #[instrument(skip(self, payload))]
    pub async fn spawn_fiber(
        &self,
        step_name: &str,
        payload: Value,
    ) -> Result<String, EngineError> {
        // 1. Resolve the step before touching storage.
        let Some(step) = self.shared.steps.get(step_name) else {
            return Err(EngineError::UnknownStep {
                name: step_name.to_string(),
            });
        };

        let fiber_id = Uuid::new_v4().to_string();
        let record = FiberRecord::new(&fiber_id, step_name, payload);

        // 2. Claim the runner slot before the first await. A recovery scan
        //    that lists the record mid-write then counts this fiber as
        //    active instead of handing it to the hook as an orphan.
        self.shared.registry.claim(&fiber_id)?;

        // 3. Persist the initial record. On failure nothing has observed
        //    the id, so the claim is simply dropped.
        if let Err(e) = self.shared.store.put_fiber(&record).await {
            self.shared.registry.release(&fiber_id);
            return Err(e);
        }
        self.shared.registry.upsert_record(&record);

        record_event(
            self.shared.store.as_ref(),
            &fiber_id,
            FiberEventKind::Spawned,
            None,
        )
        .await;

        // 4. Arm the wake timer while the fiber is in flight.
        self.shared.wake.arm(self.shared.wake_delay);

        // 5. Start the runner.
        let ctx = StepContext::new(&record, None, Arc::clone(&self.shared));
        let handle = tokio::spawn(drive_fiber(step, ctx));
        self.shared.registry.attach(&fiber_id, handle);

        info!(fiber_id = %fiber_id, "Fiber spawned");
        Ok(fiber_id)
    }

    /// Start a new runner for an existing fiber, resuming from its latest
    /// snapshot.
    ///
    /// The step function receives the original payload plus the stored
    /// snapshot as resumption context. Fails with `AlreadyRunning` while a
    /// live runner holds the fiber, `Terminal` once the fiber has settled.
    #[instrument(skip(self))]
    pub async fn restart_fiber(&self, fiber_id: &str) -> Result<(), EngineError> {
        // Claim before any await so two concurrent restarts cannot both win.
        self.shared.registry.claim(fiber_id)?;
        match self.restart_claimed(fiber_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.registry.release(fiber_id);
                Err(e)
            }
        }
    }

    async fn restart_claimed(&self, fiber_id: &str) -> Result<(), EngineError> {
        // 1. Load the record, preferring the in-process cache.
        let mut record = match self.shared.registry.get_record(fiber_id) {
            Some(record) => record,
            None => self.shared.store.get_fiber(fiber_id).await?.ok_or_else(|| {
                EngineError::NotFound {
                    fiber_id: fiber_id.to_string(),
                }
            })?,
        };

        // 2. Settled fibers never run again.
        if record.status.is_terminal() {
            return Err(EngineError::Terminal {
                fiber_id: fiber_id.to_string(),
                status: record.status,
            });
        }

        // 3. Re-resolve the step by name; the registered set may have
        //    changed since the fiber was spawned.
        let Some(step) = self.shared.steps.get(&record.step_name) else {
            return Err(EngineError::UnknownStep {
                name: record.step_name.clone(),
            });
        };

        // 4. Mark the fiber running again, keeping the snapshot for resume.
        let resume_snapshot = record.snapshot.clone();
        record.status = FiberStatus::Running;
        self.shared.store.put_fiber(&record).await?;
        self.shared.registry.upsert_record(&record);

        record_event(
            self.shared.store.as_ref(),
            fiber_id,
            FiberEventKind::Restarted,
            None,
        )
        .await;

        // 5. Arm the wake timer and start the runner.
        self.shared.wake.arm(self.shared.wake_delay);
        let ctx = StepContext::new(&record, resume_snapshot, Arc::clone(&self.shared));
        let handle = tokio::spawn(drive_fiber(step, ctx));
        self.shared.registry.attach(fiber_id, handle);

        info!(fiber_id = %fiber_id, step_name = %record.step_name, "Fiber restarted");
        Ok(())
    }

    /// Fetch a fiber's current record.
    ///
    /// Prefers the in-process cache, falling back to storage. An unknown id
    /// is `Ok(None)`, not an error.
    pub async fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, EngineError> {
        if let Some(record) = self.shared.registry.get_record(fiber_id) {
            return Ok(Some(record));
        }
        self.shared.store.get_fiber(fiber_id).await
    }

    /// Mark an orphaned fiber as abandoned.
    ///
    /// Abandonment is an owner decision; the engine never abandons a fiber
    /// on its own. Fails with `AlreadyRunning` while a live runner holds
    /// the fiber.
    #[instrument(skip(self))]
    pub async fn abandon_fiber(&self, fiber_id: &str) -> Result<(), EngineError> {
        // Hold the runner claim across the terminal write so a concurrent
        // restart cannot start a runner for a fiber being retired.
        self.shared.registry.claim(fiber_id)?;
        let result = self.abandon_claimed(fiber_id).await;
        self.shared.registry.release(fiber_id);
        result
    }

    async fn abandon_claimed(&self, fiber_id: &str) -> Result<(), EngineError> {
        let mut record = match self.shared.registry.get_record(fiber_id) {
            Some(record) => record,
            None => self.shared.store.get_fiber(fiber_id).await?.ok_or_else(|| {
                EngineError::NotFound {
                    fiber_id: fiber_id.to_string(),
                }
            })?,
        };

        if record.status.is_terminal() {
            return Err(EngineError::Terminal {
                fiber_id: fiber_id.to_string(),
                status: record.status,
            });
        }

        record.status = FiberStatus::Abandoned;
        self.shared.store.put_fiber(&record).await?;
        self.shared.registry.retire(fiber_id);

        record_event(
            self.shared.store.as_ref(),
            fiber_id,
            FiberEventKind::Abandoned,
            None,
        )
        .await;

        info!(fiber_id = %fiber_id, "Fiber abandoned");
        Ok(())
    }

    /// List fiber records, newest first, optionally filtered by status.
    pub async fn list_fibers(
        &self,
        status: Option<FiberStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberRecord>, EngineError> {
        self.shared.store.list_fibers(status, limit, offset).await
    }

    /// List a fiber's lifecycle events in append order.
    pub async fn fiber_events(
        &self,
        fiber_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberEventRecord>, EngineError> {
        self.shared.store.list_events(fiber_id, limit, offset).await
    }

    /// Run one recovery scan immediately.
    ///
    /// Finds in-flight fibers with no live runner, reports each to the
    /// recovery hook once per process lifetime, and applies the hook's
    /// decisions. Re-arms the wake timer when in-flight fibers remain.
    pub async fn run_recovery_scan(&self) -> Result<RecoveryReport, EngineError> {
        recovery::run_scan(self).await
    }

    /// When the wake timer will next fire, `None` while disarmed.
    pub fn next_wake_at(&self) -> Option<DateTime<Utc>> {
        self.shared.wake.next_wake_at()
    }

    /// Number of fibers with a live runner in this process.
    pub fn active_fiber_count(&self) -> usize {
        self.shared.registry.active_count()
    }

    /// True when the snapshot store can serve reads and writes.
    pub async fn health_check(&self) -> Result<bool, EngineError> {
        self.shared.store.health_check().await
    }

    /// Abort every live runner task. Returns how many were aborted.
    pub(crate) fn abort_active_runners(&self) -> usize {
        self.shared.registry.abort_all()
    }

    /// Watch the wake deadline for changes.
    pub(crate) fn subscribe_wake(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.shared.wake.subscribe()
    }

    /// Arm the wake timer for one more delay from now.
    pub(crate) fn rearm_wake(&self) {
        self.shared.wake.arm(self.shared.wake_delay);
    }
}

/// Append a trail event, logging instead of failing when the insert errors.
///
/// The trail is advisory; losing an event must not fail the transition that
/// produced it.
pub(crate) async fn record_event(
    store: &dyn SnapshotStore,
    fiber_id: &str,
    kind: FiberEventKind,
    detail: Option<String>,
) {
    let event = FiberEventRecord::new(fiber_id, kind, detail);
    if let Err(e) = store.insert_event(&event).await {
        warn!(
            fiber_id = %fiber_id,
            kind = kind.as_str(),
            error = %e,
            "Failed to record fiber event"
        );
    }
}
