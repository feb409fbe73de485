// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fiber records and lifecycle vocabulary.
//!
//! A fiber is one durable execution of a registered step: a row that survives
//! process death and carries the latest opaque snapshot the step stashed.
//! Records are overwritten in place as the fiber progresses; the companion
//! event rows form an append-only trail of what happened when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a fiber.
///
/// `Running` and `Checkpointed` are in-flight states; a record found in
/// either state with no live runner is an orphan. The remaining states are
/// terminal and never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiberStatus {
    /// A runner was started and nothing has been stashed since.
    Running,
    /// A snapshot has been durably stashed since the last spawn or restart.
    Checkpointed,
    /// Step returned a value; `result` holds it.
    Completed,
    /// Step returned an error or panicked; `error` holds the detail.
    Failed,
    /// Owner gave up on the fiber after it was orphaned.
    Abandoned,
}

impl FiberStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parse a status from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "checkpointed" => Some(Self::Checkpointed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// True for states that never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }
}

impl std::fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of a single fiber.
///
/// The whole record is written atomically on every transition, so a reader
/// always sees a consistent (status, snapshot) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiberRecord {
    /// Unique fiber identifier.
    pub fiber_id: String,
    /// Name of the registered step this fiber executes.
    pub step_name: String,
    /// Input payload handed to the step on every invocation.
    pub payload: Value,
    /// Latest stashed snapshot, if any. Opaque to the engine.
    pub snapshot: Option<Value>,
    /// Current lifecycle state.
    pub status: FiberStatus,
    /// Step return value, set when the fiber completes.
    pub result: Option<Value>,
    /// Failure detail, set when the fiber fails.
    pub error: Option<String>,
    /// When the fiber was first spawned.
    pub started_at: DateTime<Utc>,
    /// When the most recent snapshot was stashed.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

impl FiberRecord {
    /// Create a fresh record for a newly spawned fiber.
    pub fn new(fiber_id: impl Into<String>, step_name: impl Into<String>, payload: Value) -> Self {
        Self {
            fiber_id: fiber_id.into(),
            step_name: step_name.into(),
            payload,
            snapshot: None,
            status: FiberStatus::Running,
            result: None,
            error: None,
            started_at: Utc::now(),
            last_checkpoint_at: None,
        }
    }
}

/// Kind of lifecycle event recorded in the fiber trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiberEventKind {
    /// Fiber created and its first runner started.
    Spawned,
    /// A snapshot was durably stashed.
    Checkpointed,
    /// A new runner was started for an existing fiber.
    Restarted,
    /// The step returned a value.
    Completed,
    /// The step returned an error or panicked.
    Failed,
    /// The owner abandoned the fiber.
    Abandoned,
    /// A recovery scan found the fiber in flight with no runner.
    Orphaned,
}

impl FiberEventKind {
    /// Returns the string representation of the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Checkpointed => "checkpointed",
            Self::Restarted => "restarted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Orphaned => "orphaned",
        }
    }

    /// Parse an event kind from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawned" => Some(Self::Spawned),
            "checkpointed" => Some(Self::Checkpointed),
            "restarted" => Some(Self::Restarted),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            "orphaned" => Some(Self::Orphaned),
            _ => None,
        }
    }
}

/// One entry in a fiber's append-only event trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiberEventRecord {
    /// Row id assigned by the store, `None` before insertion.
    pub id: Option<i64>,
    /// Fiber this event belongs to.
    pub fiber_id: String,
    /// What happened.
    pub kind: FiberEventKind,
    /// Optional human-readable detail (error message, recovery decision).
    pub detail: Option<String>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl FiberEventRecord {
    /// Create an event stamped with the current time.
    pub fn new(fiber_id: impl Into<String>, kind: FiberEventKind, detail: Option<String>) -> Self {
        Self {
            id: None,
            fiber_id: fiber_id.into(),
            kind,
            detail,
            created_at: Utc::now(),
        }
    }
}
