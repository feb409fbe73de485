// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fiber runner: drives one step invocation and settles the record.
//!
//! A runner owns a fiber from claim to release. Panics inside the step are
//! caught and settled as failures, so a buggy step cannot take down the
//! process or leave its claim held forever.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::{EngineShared, record_event};
use crate::error::EngineError;
use crate::fiber::{FiberEventKind, FiberRecord, FiberStatus};
use crate::steps::Step;

struct ContextInner {
    fiber_id: String,
    step_name: String,
    payload: Value,
    resume_snapshot: Option<Value>,
    shared: Arc<EngineShared>,
}

/// Handle a running step uses to read its identity and stash snapshots.
///
/// Cloneable so a step can hand it to concurrent sub-tasks; all clones
/// stash into the same fiber record.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

impl StepContext {
    pub(crate) fn new(
        record: &FiberRecord,
        resume_snapshot: Option<Value>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                fiber_id: record.fiber_id.clone(),
                step_name: record.step_name.clone(),
                payload: record.payload.clone(),
                resume_snapshot,
                shared,
            }),
        }
    }

    /// Id of the fiber this context belongs to.
    pub fn fiber_id(&self) -> &str {
        &self.inner.fiber_id
    }

    /// Name the step was registered under.
    pub fn step_name(&self) -> &str {
        &self.inner.step_name
    }

    /// Payload the fiber was spawned with.
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Snapshot stashed by a previous run, present only on restart.
    pub fn resume_snapshot(&self) -> Option<&Value> {
        self.inner.resume_snapshot.as_ref()
    }

    /// True when this invocation resumes a previous run.
    pub fn is_resume(&self) -> bool {
        self.inner.resume_snapshot.is_some()
    }

    /// Durably stash a snapshot of the step's progress.
    ///
    /// Returns only after the whole record, snapshot included, is written
    /// to the snapshot store. On `Err` nothing was stashed and the prior
    /// snapshot remains current; the step decides whether to retry or
    /// bail. Anything computed after the last successful stash is re-run
    /// after an eviction, so work between stashes must be safe to repeat.
    pub async fn stash(&self, snapshot: Value) -> Result<(), EngineError> {
        let shared = &self.inner.shared;
        let fiber_id = &self.inner.fiber_id;

        // 1. Load the current record, preferring the in-process cache.
        let mut record = match shared.registry.get_record(fiber_id) {
            Some(record) => record,
            None => shared.store.get_fiber(fiber_id).await?.ok_or_else(|| {
                EngineError::NotFound {
                    fiber_id: fiber_id.clone(),
                }
            })?,
        };

        // 2. Settled fibers take no further checkpoints. Guards against a
        //    leaked context clone stashing after the runner finished.
        if record.status.is_terminal() {
            return Err(EngineError::Terminal {
                fiber_id: fiber_id.clone(),
                status: record.status,
            });
        }

        // 3. Write the whole record before reporting success.
        record.snapshot = Some(snapshot);
        record.status = FiberStatus::Checkpointed;
        record.last_checkpoint_at = Some(Utc::now());
        shared.store.put_fiber(&record).await?;
        shared.registry.upsert_record(&record);

        // 4. The trail entry is advisory and must not undo the stash.
        record_event(
            shared.store.as_ref(),
            fiber_id,
            FiberEventKind::Checkpointed,
            None,
        )
        .await;

        debug!(fiber_id = %fiber_id, "Snapshot stashed");
        Ok(())
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("fiber_id", &self.inner.fiber_id)
            .field("step_name", &self.inner.step_name)
            .field("is_resume", &self.is_resume())
            .finish()
    }
}

/// Run one step invocation to its end and settle the fiber record.
///
/// Spawned as a task by the engine; holds the fiber's runner claim until
/// the record is settled (or the settle write fails, in which case the
/// fiber stays in flight for the next recovery scan).
pub(crate) async fn drive_fiber(step: Arc<dyn Step>, ctx: StepContext) {
    let fiber_id = ctx.inner.fiber_id.clone();
    let shared = Arc::clone(&ctx.inner.shared);

    let outcome = AssertUnwindSafe(step.run(ctx)).catch_unwind().await;
    let (status, result, error) = match outcome {
        Ok(Ok(value)) => (FiberStatus::Completed, Some(value), None),
        Ok(Err(e)) => (FiberStatus::Failed, None, Some(format!("{e:#}"))),
        Err(panic) => (FiberStatus::Failed, None, Some(panic_detail(panic))),
    };

    finish_fiber(&shared, &fiber_id, status, result, error).await;
    shared.registry.release(&fiber_id);
}

async fn finish_fiber(
    shared: &EngineShared,
    fiber_id: &str,
    status: FiberStatus,
    result: Option<Value>,
    error: Option<String>,
) {
    let record = match shared.registry.get_record(fiber_id) {
        Some(record) => Some(record),
        None => match shared.store.get_fiber(fiber_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(fiber_id = %fiber_id, error = %e, "Failed to load record while settling fiber");
                None
            }
        },
    };
    let Some(mut record) = record else {
        warn!(fiber_id = %fiber_id, "No record found while settling fiber");
        return;
    };

    if record.status.is_terminal() {
        debug!(
            fiber_id = %fiber_id,
            status = record.status.as_str(),
            "Fiber already terminal, skipping settle"
        );
        return;
    }

    record.status = status;
    record.result = result;
    record.error = error.clone();

    if let Err(e) = shared.store.put_fiber(&record).await {
        // The record stays in flight; the next recovery scan reports it.
        warn!(fiber_id = %fiber_id, error = %e, "Failed to persist terminal state");
        return;
    }
    shared.registry.retire(fiber_id);

    let kind = match status {
        FiberStatus::Completed => FiberEventKind::Completed,
        _ => FiberEventKind::Failed,
    };
    record_event(shared.store.as_ref(), fiber_id, kind, error).await;

    info!(fiber_id = %fiber_id, status = status.as_str(), "Fiber settled");
}

fn panic_detail(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("step panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("step panicked: {s}")
    } else {
        "step panicked".to_string()
    }
}
