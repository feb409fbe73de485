// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for snapshot stashing.
//!
//! Stash is the durability contract: when it returns `Ok` the snapshot is
//! in storage. Each stash replaces the previous snapshot whole, and a
//! failed stash leaves the prior snapshot current.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use common::*;
use filament_core::{
    FiberEventKind, FiberStatus, MemorySnapshotStore, SnapshotStore, StepContext, StepRegistry,
};

#[tokio::test]
async fn test_stash_persists_before_step_returns() {
    let store = Arc::new(MemorySnapshotStore::new());
    let gate = Arc::new(Notify::new());

    let mut steps = StepRegistry::new();
    let step_gate = Arc::clone(&gate);
    steps.register_fn("stash_then_wait", move |ctx| {
        let gate = Arc::clone(&step_gate);
        async move {
            ctx.stash(json!({"stage": 1})).await?;
            gate.notified().await;
            Ok(json!({"done": true}))
        }
    });

    let runtime = start_runtime(store.clone(), steps, RecordingHook::leave_all()).await;
    let fiber_id = runtime
        .engine()
        .spawn_fiber("stash_then_wait", json!({}))
        .await
        .expect("spawn");

    // The snapshot must be readable while the step is still running.
    wait_for_snapshot(store.as_ref(), &fiber_id, &json!({"stage": 1})).await;
    let mid = store
        .get_fiber(&fiber_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(mid.status, FiberStatus::Checkpointed);
    assert!(mid.last_checkpoint_at.is_some());

    gate.notify_one();
    let settled = wait_for_terminal(runtime.engine(), &fiber_id).await;
    assert_eq!(settled.status, FiberStatus::Completed);
    assert_eq!(settled.result, Some(json!({"done": true})));
    assert_eq!(settled.snapshot, Some(json!({"stage": 1})));

    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_each_stash_replaces_previous_snapshot() {
    let store = Arc::new(MemorySnapshotStore::new());

    let mut steps = StepRegistry::new();
    steps.register_fn("two_stashes", |ctx| async move {
        ctx.stash(json!({"a": 1})).await?;
        ctx.stash(json!({"b": 2})).await?;
        Ok(json!(2))
    });

    let runtime = start_runtime(store.clone(), steps, RecordingHook::leave_all()).await;
    let fiber_id = runtime
        .engine()
        .spawn_fiber("two_stashes", json!({}))
        .await
        .expect("spawn");

    let settled = wait_for_terminal(runtime.engine(), &fiber_id).await;
    // The second stash replaces the first outright, no merging.
    assert_eq!(settled.snapshot, Some(json!({"b": 2})));

    let events = runtime
        .engine()
        .fiber_events(&fiber_id, 50, 0)
        .await
        .expect("events");
    let kinds: Vec<FiberEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FiberEventKind::Spawned,
            FiberEventKind::Checkpointed,
            FiberEventKind::Checkpointed,
            FiberEventKind::Completed,
        ]
    );
}

#[tokio::test]
async fn test_pipeline_stashes_every_stage() {
    let store = Arc::new(MemorySnapshotStore::new());

    let mut steps = StepRegistry::new();
    steps.register_fn("pipeline", |ctx| async move {
        for stage in 0..5 {
            ctx.stash(json!({"next": stage + 1})).await?;
        }
        Ok(json!({"stages": 5}))
    });

    let runtime = start_runtime(store.clone(), steps, RecordingHook::leave_all()).await;
    let fiber_id = runtime
        .engine()
        .spawn_fiber("pipeline", json!({}))
        .await
        .expect("spawn");

    let settled = wait_for_terminal(runtime.engine(), &fiber_id).await;
    assert_eq!(settled.status, FiberStatus::Completed);
    assert_eq!(settled.snapshot, Some(json!({"next": 5})));

    let events = runtime
        .engine()
        .fiber_events(&fiber_id, 50, 0)
        .await
        .expect("events");
    let checkpoints = events
        .iter()
        .filter(|e| e.kind == FiberEventKind::Checkpointed)
        .count();
    assert_eq!(checkpoints, 5);
    for pair in events.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
}

#[tokio::test]
async fn test_stash_failure_propagates_and_keeps_prior_snapshot() {
    let store = FailingStore::new();

    let mut steps = StepRegistry::new();
    let step_store = Arc::clone(&store);
    steps.register_fn("flaky", move |ctx| {
        let store = Arc::clone(&step_store);
        async move {
            ctx.stash(json!({"stage": 1})).await?;
            store.fail_puts(true);
            let err = ctx
                .stash(json!({"stage": 2}))
                .await
                .expect_err("stash must fail while writes are broken");
            store.fail_puts(false);
            Err(anyhow::Error::from(err).context("second stash failed"))
        }
    });

    let runtime = start_runtime(store.clone(), steps, RecordingHook::leave_all()).await;
    let fiber_id = runtime
        .engine()
        .spawn_fiber("flaky", json!({}))
        .await
        .expect("spawn");

    let settled = wait_for_terminal(runtime.engine(), &fiber_id).await;
    assert_eq!(settled.status, FiberStatus::Failed);
    // The failed stash wrote nothing; the first snapshot is still current.
    assert_eq!(settled.snapshot, Some(json!({"stage": 1})));
    let error = settled.error.expect("error detail");
    assert!(error.contains("second stash failed"), "got: {error}");
    assert!(error.contains("injected write failure"), "got: {error}");
}

#[tokio::test]
async fn test_settle_write_failure_leaves_fiber_in_flight() {
    let store = FailingStore::new();
    let hook = RecordingHook::leave_all();

    let mut steps = StepRegistry::new();
    let step_store = Arc::clone(&store);
    steps.register_fn("complete_during_outage", move |ctx| {
        let store = Arc::clone(&step_store);
        async move {
            ctx.stash(json!({"stage": 1})).await?;
            // Break writes just before returning so the settle write fails.
            store.fail_puts(true);
            Ok(json!("done"))
        }
    });

    let runtime = start_runtime(store.clone(), steps, hook.clone()).await;
    let fiber_id = runtime
        .engine()
        .spawn_fiber("complete_during_outage", json!({}))
        .await
        .expect("spawn");

    // Wait for the runner to give up its claim.
    for _ in 0..1000 {
        if runtime.engine().active_fiber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(runtime.engine().active_fiber_count(), 0);

    let stuck = store
        .get_fiber(&fiber_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(stuck.status, FiberStatus::Checkpointed);
    assert_eq!(stuck.snapshot, Some(json!({"stage": 1})));

    // Once writes recover, the next scan reports the fiber as an orphan.
    store.fail_puts(false);
    let report = runtime
        .engine()
        .run_recovery_scan()
        .await
        .expect("scan");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.left, 1);

    let seen = hook.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].fiber_id, fiber_id);
    assert!(seen[0].has_snapshot());
}

#[tokio::test]
async fn test_stash_from_leaked_context_after_settle_is_rejected() {
    let store = Arc::new(MemorySnapshotStore::new());
    let leaked: Arc<Mutex<Option<StepContext>>> = Arc::new(Mutex::new(None));

    let mut steps = StepRegistry::new();
    let step_leaked = Arc::clone(&leaked);
    steps.register_fn("leak_context", move |ctx| {
        let leaked = Arc::clone(&step_leaked);
        async move {
            leaked.lock().unwrap().replace(ctx.clone());
            Ok(json!(null))
        }
    });

    let runtime = start_runtime(store.clone(), steps, RecordingHook::leave_all()).await;
    let fiber_id = runtime
        .engine()
        .spawn_fiber("leak_context", json!({}))
        .await
        .expect("spawn");
    wait_for_terminal(runtime.engine(), &fiber_id).await;

    let ctx = leaked.lock().unwrap().take().expect("leaked context");
    let err = ctx
        .stash(json!({"late": true}))
        .await
        .expect_err("stash after settle must fail");
    assert_eq!(err.error_code(), "TERMINAL");

    let settled = store
        .get_fiber(&fiber_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(settled.status, FiberStatus::Completed);
    assert!(settled.snapshot.is_none());
}
