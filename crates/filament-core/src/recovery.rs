// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orphan recovery: the scan, the owner hook, and the wake timer.
//!
//! An eviction wipes the in-process registry but leaves in-flight fiber
//! records in storage. The recovery scan finds those records, hands each
//! one to the owner's hook exactly once per process lifetime, and applies
//! the hook's decision. The wake timer drives the scan: it is armed
//! whenever fibers are in flight and re-armed after every scan that still
//! saw some, so a fully settled system goes quiet on its own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::{FiberEngine, record_event};
use crate::error::EngineError;
use crate::fiber::{FiberEventKind, FiberRecord, FiberStatus};

/// What to do with one orphaned fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Start a new runner, resuming from the latest snapshot.
    Restart,
    /// Leave the record untouched. The fiber stays in flight in storage
    /// but is not reported again during this process lifetime.
    Leave,
}

/// An in-flight fiber with no live runner, as handed to the recovery hook.
#[derive(Debug, Clone)]
pub struct OrphanedFiber {
    /// Fiber id, usable with `restart_fiber` / `abandon_fiber`.
    pub fiber_id: String,
    /// Step the fiber executes.
    pub step_name: String,
    /// Payload the fiber was spawned with.
    pub payload: Value,
    /// Latest stashed snapshot, if any survived.
    pub snapshot: Option<Value>,
    /// Status the record was found in.
    pub status: FiberStatus,
    /// When the fiber was first spawned.
    pub started_at: DateTime<Utc>,
    /// When the most recent snapshot was stashed.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

impl OrphanedFiber {
    pub(crate) fn from_record(record: &FiberRecord) -> Self {
        Self {
            fiber_id: record.fiber_id.clone(),
            step_name: record.step_name.clone(),
            payload: record.payload.clone(),
            snapshot: record.snapshot.clone(),
            status: record.status,
            started_at: record.started_at,
            last_checkpoint_at: record.last_checkpoint_at,
        }
    }

    /// True when at least one snapshot was stashed before the eviction.
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// Owner-supplied policy for orphaned fibers.
///
/// Called at most once per orphan per process lifetime. A returned error
/// is treated as an owner bug: it is logged and the orphan stays
/// unreported, so the next scan hands it to the hook again.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    /// Decide what to do with one orphaned fiber.
    async fn decide(&self, orphan: &OrphanedFiber) -> anyhow::Result<RecoveryDecision>;
}

/// Hook that leaves every orphan untouched.
///
/// The default when no hook is configured; scans then only report.
pub struct LeaveAll;

#[async_trait]
impl RecoveryHook for LeaveAll {
    async fn decide(&self, _orphan: &OrphanedFiber) -> anyhow::Result<RecoveryDecision> {
        Ok(RecoveryDecision::Leave)
    }
}

struct FnHook<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RecoveryHook for FnHook<F>
where
    F: Fn(OrphanedFiber) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RecoveryDecision>> + Send + 'static,
{
    async fn decide(&self, orphan: &OrphanedFiber) -> anyhow::Result<RecoveryDecision> {
        (self.f)(orphan.clone()).await
    }
}

/// Wrap an async closure as a recovery hook.
///
/// # Example
///
/// ```
/// use filament_core::{RecoveryDecision, hook_fn};
///
/// let hook = hook_fn(|orphan| async move {
///     if orphan.has_snapshot() {
///         Ok(RecoveryDecision::Restart)
///     } else {
///         Ok(RecoveryDecision::Leave)
///     }
/// });
/// # let _ = hook;
/// ```
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn RecoveryHook>
where
    F: Fn(OrphanedFiber) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RecoveryDecision>> + Send + 'static,
{
    Arc::new(FnHook { f })
}

/// Tally of one recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-flight records the scan saw.
    pub scanned: usize,
    /// Records that had a live runner in this process.
    pub active: usize,
    /// Orphans the hook chose to restart.
    pub restarted: usize,
    /// Orphans the hook chose to leave.
    pub left: usize,
    /// Orphans already reported earlier in this process and skipped.
    pub deferred: usize,
    /// Orphans whose hook call or restart attempt failed.
    pub failed: usize,
}

/// One recovery pass over every in-flight fiber record.
pub(crate) async fn run_scan(engine: &FiberEngine) -> Result<RecoveryReport, EngineError> {
    let shared = engine.shared();
    let _guard = shared.scan_lock.lock().await;

    // Consume the armed deadline. The scan re-arms before returning while
    // in-flight fibers remain, so an expired deadline cannot pin the timer
    // in the past.
    shared.wake.disarm();

    let in_flight = shared
        .store
        .list_fibers_by_status(&[FiberStatus::Running, FiberStatus::Checkpointed])
        .await?;

    // Rebuild the record cache from storage without clobbering fibers that
    // have a live runner here.
    shared.registry.reconcile(&in_flight);

    let mut report = RecoveryReport {
        scanned: in_flight.len(),
        ..Default::default()
    };

    for record in &in_flight {
        if shared.registry.has_active_runner(&record.fiber_id) {
            report.active += 1;
            continue;
        }
        if shared.registry.was_reported(&record.fiber_id) {
            report.deferred += 1;
            continue;
        }

        warn!(
            fiber_id = %record.fiber_id,
            step_name = %record.step_name,
            status = record.status.as_str(),
            "Orphaned fiber detected"
        );
        record_event(
            shared.store.as_ref(),
            &record.fiber_id,
            FiberEventKind::Orphaned,
            None,
        )
        .await;

        let orphan = OrphanedFiber::from_record(record);
        match shared.hook.decide(&orphan).await {
            Ok(RecoveryDecision::Restart) => {
                match engine.restart_fiber(&record.fiber_id).await {
                    Ok(()) => report.restarted += 1,
                    Err(EngineError::AlreadyRunning { .. }) => {
                        // A concurrent owner call won the claim; the orphan
                        // is being handled either way.
                        report.active += 1;
                    }
                    Err(e) => {
                        error!(
                            fiber_id = %record.fiber_id,
                            error = %e,
                            "Failed to restart orphaned fiber"
                        );
                        report.failed += 1;
                    }
                }
            }
            Ok(RecoveryDecision::Leave) => {
                shared.registry.mark_reported(&record.fiber_id);
                report.left += 1;
                info!(fiber_id = %record.fiber_id, "Orphaned fiber left for owner reconciliation");
            }
            Err(e) => {
                error!(fiber_id = %record.fiber_id, error = %e, "Recovery hook failed");
                report.failed += 1;
                // Stays unreported; the next scan hands it to the hook again.
            }
        }
    }

    if report.scanned > 0 {
        shared.wake.arm(shared.wake_delay);
    }

    info!(
        scanned = report.scanned,
        active = report.active,
        restarted = report.restarted,
        left = report.left,
        deferred = report.deferred,
        failed = report.failed,
        "Recovery scan finished"
    );
    Ok(report)
}

/// One-shot, re-armable deadline for the next recovery scan.
///
/// Arming keeps the earliest pending deadline, so concurrent spawns cannot
/// push the next scan further out. Built on a watch channel so the wake
/// driver never misses a change between reading the deadline and sleeping
/// against it.
pub(crate) struct WakeController {
    deadline: watch::Sender<Option<DateTime<Utc>>>,
}

impl WakeController {
    pub(crate) fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self { deadline }
    }

    /// Arm the timer `delay` from now, keeping an earlier armed deadline.
    pub(crate) fn arm(&self, delay: Duration) {
        // Delays beyond chrono's range clamp to a year.
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        let target = Utc::now() + delay;

        self.deadline.send_if_modified(|deadline| match deadline {
            Some(existing) if *existing <= target => false,
            _ => {
                *deadline = Some(target);
                true
            }
        });
    }

    /// Clear the armed deadline.
    pub(crate) fn disarm(&self) {
        self.deadline
            .send_if_modified(|deadline| deadline.take().is_some());
    }

    pub(crate) fn next_wake_at(&self) -> Option<DateTime<Utc>> {
        *self.deadline.borrow()
    }

    /// Subscribe to deadline changes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.deadline.subscribe()
    }
}
