// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manual Recovery - Demonstrates operator-driven orphan handling.
//!
//! This example shows:
//! - Running the engine without the background wake driver
//! - Triggering a recovery scan by hand and reading the report
//! - An age-based recovery hook: restart recent orphans, leave stale
//!   ones for review
//!
//! Run with: cargo run -p fiber-example --bin manual_recovery
//!
//! The example seeds two orphaned fibers into an empty database so the
//! scan has something to find.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use filament_core::{
    Config, FiberRecord, FiberRuntime, FiberStatus, RecoveryDecision, SnapshotStore,
    SqliteSnapshotStore, StepRegistry, hook_fn,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("manual_recovery=info".parse()?)
                .add_directive("filament_core=info".parse()?),
        )
        .init();

    info!("=== Manual Recovery: one scan, operator policy ===");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            warn!("{e}; falling back to .data/recovery-demo.db");
            Config {
                database_path: ".data/recovery-demo.db".into(),
                wake_delay: Duration::from_secs(30),
                recover_on_start: true,
            }
        }
    };

    let store = Arc::new(SqliteSnapshotStore::from_path(&config.database_path).await?);
    seed_orphans_if_empty(store.as_ref()).await?;

    let mut steps = StepRegistry::new();
    steps.register_fn("replay_webhook", |ctx| async move {
        let delivered = ctx
            .resume_snapshot()
            .and_then(|s| s["delivered"].as_u64())
            .unwrap_or(0);
        let total = ctx.payload()["deliveries"].as_u64().unwrap_or(0);
        info!(delivered, total, "Replaying remaining webhook deliveries");

        for n in delivered..total {
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.stash(json!({"delivered": n + 1})).await?;
            info!(delivery = n + 1, "Delivery confirmed");
        }
        Ok(json!({"delivered": total}))
    });

    // Restart orphans that were active within the last hour; anything
    // older stays put for a human to look at.
    let hook = hook_fn(|orphan| async move {
        let last_seen = orphan.last_checkpoint_at.unwrap_or(orphan.started_at);
        let age = Utc::now() - last_seen;
        if age < chrono::Duration::hours(1) {
            info!(fiber_id = %orphan.fiber_id, age_secs = age.num_seconds(), "Restarting recent orphan");
            Ok(RecoveryDecision::Restart)
        } else {
            warn!(fiber_id = %orphan.fiber_id, age_secs = age.num_seconds(), "Leaving stale orphan for review");
            Ok(RecoveryDecision::Leave)
        }
    });

    let runtime = FiberRuntime::builder()
        .store(store)
        .steps(steps)
        .recovery_hook(hook)
        .recover_on_start(false)
        .wake_driver(false)
        .build()?
        .start()
        .await?;
    let engine = runtime.engine();

    let report = engine.run_recovery_scan().await?;
    info!(
        scanned = report.scanned,
        active = report.active,
        restarted = report.restarted,
        left = report.left,
        deferred = report.deferred,
        failed = report.failed,
        "Scan report"
    );
    match engine.next_wake_at() {
        Some(at) => info!(next_wake_at = %at, "Wake timer armed for the next scan"),
        None => info!("Wake timer disarmed; nothing left in flight"),
    }

    // Give the restarted fiber time to finish its replay.
    while engine.active_fiber_count() > 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("Fibers after recovery:");
    for record in engine.list_fibers(None, 20, 0).await? {
        info!(
            fiber_id = %record.fiber_id,
            step = %record.step_name,
            status = %record.status,
            "Fiber"
        );
    }

    runtime.shutdown().await?;
    info!("=== Done ===");
    Ok(())
}

/// Seed two orphaned fibers so the scan has work, but only into an
/// empty database so reruns observe the previous outcome.
async fn seed_orphans_if_empty(store: &SqliteSnapshotStore) -> Result<()> {
    if !store.list_fibers(None, 1, 0).await?.is_empty() {
        return Ok(());
    }

    let mut fresh = FiberRecord::new(
        "webhook-replay-fresh",
        "replay_webhook",
        json!({"deliveries": 5}),
    );
    fresh.status = FiberStatus::Checkpointed;
    fresh.snapshot = Some(json!({"delivered": 2}));
    fresh.started_at = Utc::now() - chrono::Duration::minutes(5);
    fresh.last_checkpoint_at = Some(Utc::now() - chrono::Duration::minutes(4));
    store.put_fiber(&fresh).await?;

    let mut stale = FiberRecord::new(
        "webhook-replay-stale",
        "replay_webhook",
        json!({"deliveries": 3}),
    );
    stale.status = FiberStatus::Running;
    stale.started_at = Utc::now() - chrono::Duration::days(3);
    store.put_fiber(&stale).await?;

    info!("Seeded one recent and one stale orphan");
    Ok(())
}
