// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filament Core - Durable Fiber Engine
//!
//! This crate runs named steps as *fibers*: background tasks that stash
//! opaque snapshots of their progress to durable storage. When the host
//! process is evicted mid-run, the snapshots survive; after restart the
//! engine detects the orphaned fibers and asks the owner whether to resume
//! each one from its latest snapshot or leave it alone.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Owner Application                         │
//! │        (registers steps, spawns fibers, recovery hook)          │
//! └─────────────────────────────────────────────────────────────────┘
//!       │ spawn / restart / abandon                ▲
//!       ▼                                          │ RecoveryHook
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         FiberEngine                             │
//! │    step registry · runner claims · recovery scan · wake timer   │
//! └─────────────────────────────────────────────────────────────────┘
//!       │ records + trail events
//!       ▼
//! ┌───────────────────────┐
//! │     SnapshotStore     │
//! │  (SQLite or memory)   │
//! └───────────────────────┘
//! ```
//!
//! # Engine Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `spawn_fiber` | Mint a fiber id, persist the record, start a runner |
//! | `restart_fiber` | Start a new runner for an in-flight fiber, resuming from its snapshot |
//! | `abandon_fiber` | Retire an in-flight fiber without running it |
//! | `get_fiber` | Fetch one fiber record |
//! | `list_fibers` | List fibers, optionally filtered by status, newest first |
//! | `fiber_events` | Read the append-only trail for one fiber |
//! | `run_recovery_scan` | Find orphaned fibers and apply the hook's decisions |
//!
//! # Stash Semantics
//!
//! `StepContext::stash` is the durability mechanism:
//!
//! 1. **Each stash persists before returning**: when `stash` resolves `Ok`,
//!    the snapshot is in storage and survives eviction
//! 2. **Each stash replaces the previous snapshot whole**: no merging, the
//!    step owns the snapshot format
//! 3. **Resume re-invokes the step**: a restarted fiber runs the same step
//!    from the top with the latest snapshot in `resume_snapshot`
//!
//! Work done between stashes is lost on eviction, so steps must keep the
//! stretch between stashes repeatable.
//!
//! # Fiber Status State Machine
//!
//! ```text
//!                      ┌─────────┐
//!        spawn ───────▶│ RUNNING │◀─────── restart (snapshot kept)
//!                      └────┬────┘
//!                           │ stash
//!                           ▼
//!                   ┌──────────────┐  stash
//!                   │ CHECKPOINTED │◀───────┐
//!                   └──────┬───────┘────────┘
//!                          │
//!         ┌────────────────┼────────────────┐
//!         │ step returns   │ step errors    │ abandon_fiber
//!         ▼                ▼                ▼
//!   ┌───────────┐     ┌────────┐     ┌───────────┐
//!   │ COMPLETED │     │ FAILED │     │ ABANDONED │
//!   └───────────┘     └────────┘     └───────────┘
//! ```
//!
//! A fiber that never stashes settles straight from `RUNNING` the same
//! three ways.
//!
//! ## Status Descriptions
//!
//! | Status | Description |
//! |--------|-------------|
//! | `RUNNING` | A runner was started and nothing has been stashed since |
//! | `CHECKPOINTED` | A snapshot was durably stashed since the last spawn or restart |
//! | `COMPLETED` | The step returned a value |
//! | `FAILED` | The step returned an error or panicked |
//! | `ABANDONED` | The owner retired the fiber without completing it |
//!
//! `RUNNING` and `CHECKPOINTED` are the *in-flight* statuses: storage says
//! the fiber should be executing somewhere. An in-flight record with no
//! live runner in this process is an *orphan*.
//!
//! # Recovery
//!
//! An eviction kills runner tasks but leaves their records in flight in
//! storage. The recovery scan (run at startup and again whenever the wake
//! timer fires) finds every orphan, reports it to the owner's
//! [`RecoveryHook`] once per process lifetime, and applies the decision:
//! `Restart` resumes the fiber from its snapshot, `Leave` keeps the record
//! untouched for the owner to reconcile out of band.
//!
//! # Configuration
//!
//! [`Config::from_env`] loads settings from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FILAMENT_DATABASE_PATH` | Yes | - | SQLite database file path |
//! | `FILAMENT_WAKE_DELAY_MS` | No | `30000` | Wake timer delay in milliseconds |
//! | `FILAMENT_RECOVER_ON_START` | No | `true` | Run a recovery scan at startup |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`engine`]: Fiber lifecycle operations
//! - [`error`]: Error types with stable error codes
//! - [`fiber`]: Fiber records, statuses, and trail events
//! - [`migrations`]: Embedded SQLite migrations (behind the `sqlite` feature)
//! - [`persistence`]: Snapshot store trait with SQLite and in-memory backends
//! - [`recovery`]: Orphan detection, the recovery hook, and scan reports
//! - [`runner`]: Step execution context and the stash operation
//! - [`runtime`]: Embeddable runtime hosting the engine and its wake driver
//! - [`steps`]: Step trait and registry

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Fiber lifecycle operations (spawn, restart, abandon, inspect, recover).
pub mod engine;

/// Error types for engine operations with stable error codes.
pub mod error;

/// Fiber records, statuses, and trail events.
pub mod fiber;

/// Embedded SQLite migrations for the snapshot schema.
#[cfg(feature = "sqlite")]
pub mod migrations;

/// Snapshot store trait with SQLite and in-memory backends.
pub mod persistence;

/// Orphan detection, the recovery hook, and scan reports.
pub mod recovery;

/// Step execution context and the stash operation.
pub mod runner;

/// Embeddable runtime hosting the engine and its wake driver.
pub mod runtime;

/// Step trait and registry.
pub mod steps;

mod registry;

// Main types
pub use config::{Config, ConfigError};
pub use engine::FiberEngine;
pub use error::{EngineError, Result};
pub use fiber::{FiberEventKind, FiberEventRecord, FiberRecord, FiberStatus};
pub use runner::StepContext;
pub use runtime::{FiberRuntime, FiberRuntimeBuilder, FiberRuntimeConfig};
pub use steps::{Step, StepRegistry};

// Recovery surface
pub use recovery::{
    LeaveAll, OrphanedFiber, RecoveryDecision, RecoveryHook, RecoveryReport, hook_fn,
};

// Persistence backends
pub use persistence::{MemorySnapshotStore, SnapshotStore};

#[cfg(feature = "sqlite")]
pub use persistence::SqliteSnapshotStore;
