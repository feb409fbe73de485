// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumable Pipeline - Demonstrates durable fiber execution.
//!
//! This example shows:
//! - A multi-stage step that stashes a snapshot after every stage
//! - Surviving a hard kill: Ctrl-C mid-run, then run again
//! - The startup recovery scan handing the orphan to the recovery hook
//! - The restarted step resuming from the latest snapshot, not stage 0
//!
//! Run with: cargo run -p fiber-example --bin resumable_pipeline
//! Kill it mid-run and run it again; it picks up where it left off.
//! Delete .data/fibers.db to start over from stage 0.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use filament_core::{
    Config, FiberEngine, FiberRuntime, FiberStatus, RecoveryDecision, SqliteSnapshotStore,
    StepRegistry, hook_fn,
};

const TOTAL_STAGES: u64 = 8;

/// State stashed after every completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PipelineSnapshot {
    /// The next stage to run.
    next_stage: u64,
    /// Batches exported so far.
    exported: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("resumable_pipeline=info".parse()?)
                .add_directive("filament_core=info".parse()?),
        )
        .init();

    info!("=== Resumable Pipeline: kill me mid-run, then run me again ===");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            warn!("{e}; falling back to .data/fibers.db");
            Config {
                database_path: ".data/fibers.db".into(),
                wake_delay: Duration::from_secs(10),
                recover_on_start: true,
            }
        }
    };

    let store = Arc::new(SqliteSnapshotStore::from_path(&config.database_path).await?);

    let mut steps = StepRegistry::new();
    steps.register_fn("export_orders", |ctx| async move {
        let mut state = match ctx.resume_snapshot() {
            Some(value) => {
                let state: PipelineSnapshot = serde_json::from_value(value.clone())?;
                info!(next_stage = state.next_stage, "Resuming from snapshot");
                state
            }
            None => PipelineSnapshot {
                next_stage: 0,
                exported: Vec::new(),
            },
        };

        while state.next_stage < TOTAL_STAGES {
            let stage = state.next_stage;
            info!(stage, "Exporting batch");
            // Simulated work. A kill during this sleep loses only this stage.
            tokio::time::sleep(Duration::from_secs(2)).await;

            state.exported.push(format!("batch-{stage:03}"));
            state.next_stage = stage + 1;
            ctx.stash(serde_json::to_value(&state)?).await?;
            info!(stage, "Stage durable");
        }

        Ok(json!({
            "exported": state.exported,
            "stages": TOTAL_STAGES,
        }))
    });

    // Restart every orphan this process finds.
    let runtime = FiberRuntime::builder()
        .store(store)
        .steps(steps)
        .recovery_hook(hook_fn(|orphan| async move {
            info!(
                fiber_id = %orphan.fiber_id,
                status = %orphan.status,
                has_snapshot = orphan.has_snapshot(),
                "Orphan found; restarting"
            );
            Ok(RecoveryDecision::Restart)
        }))
        .wake_delay(config.wake_delay)
        .recover_on_start(config.recover_on_start)
        .build()?
        .start()
        .await?;

    // Pick up the fiber from a previous run, or spawn a fresh one.
    let engine = runtime.engine();
    let fiber_id = match find_in_flight(engine).await? {
        Some(id) => {
            info!(fiber_id = %id, "Continuing fiber from a previous run");
            id
        }
        None => {
            let id = engine
                .spawn_fiber("export_orders", json!({"shop": "demo"}))
                .await?;
            info!(fiber_id = %id, "Spawned new pipeline fiber");
            id
        }
    };

    // Follow the fiber until it settles.
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(record) = engine.get_fiber(&fiber_id).await? else {
            warn!(fiber_id = %fiber_id, "Fiber record disappeared");
            break;
        };
        match record.status {
            FiberStatus::Running | FiberStatus::Checkpointed => {
                if let Some(snapshot) = &record.snapshot {
                    info!(next_stage = %snapshot["next_stage"], "In flight");
                }
            }
            FiberStatus::Completed => {
                let result = record.result.unwrap_or(json!(null));
                info!(result = %result, "Pipeline complete");
                break;
            }
            FiberStatus::Failed => {
                warn!(
                    error = record.error.as_deref().unwrap_or("unknown"),
                    "Pipeline failed"
                );
                break;
            }
            FiberStatus::Abandoned => {
                warn!("Pipeline abandoned");
                break;
            }
        }
    }

    runtime.shutdown().await?;
    info!("=== Done. Delete the database file to start from stage 0 ===");
    Ok(())
}

/// Find a fiber left in flight by a previous run, if any.
async fn find_in_flight(engine: &FiberEngine) -> Result<Option<String>> {
    for status in [FiberStatus::Running, FiberStatus::Checkpointed] {
        let fibers = engine.list_fibers(Some(status), 1, 0).await?;
        if let Some(record) = fibers.into_iter().next() {
            return Ok(Some(record.fiber_id));
        }
    }
    Ok(None)
}
