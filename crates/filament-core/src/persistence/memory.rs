// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory snapshot store.
//!
//! Keeps every record in process memory. Nothing survives a restart, so
//! this backend is for tests and for embedding the engine in scratch
//! environments where durability does not matter.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::fiber::{FiberEventRecord, FiberRecord, FiberStatus};
use crate::persistence::SnapshotStore;

#[derive(Default)]
struct Inner {
    fibers: HashMap<String, FiberRecord>,
    events: Vec<FiberEventRecord>,
    next_event_id: i64,
}

/// Snapshot store backed by process memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<Inner>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn take_count(limit: i64) -> usize {
    // Negative limit means unlimited, matching SQLite's LIMIT -1.
    if limit < 0 { usize::MAX } else { limit as usize }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put_fiber(&self, record: &FiberRecord) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        inner
            .fibers
            .insert(record.fiber_id.clone(), record.clone());
        Ok(())
    }

    async fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner.fibers.get(fiber_id).cloned())
    }

    async fn list_fibers(
        &self,
        status: Option<FiberStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberRecord>, EngineError> {
        let inner = self.inner.read().await;
        let mut records: Vec<FiberRecord> = inner
            .fibers
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(take_count(limit))
            .collect())
    }

    async fn list_fibers_by_status(
        &self,
        statuses: &[FiberStatus],
    ) -> Result<Vec<FiberRecord>, EngineError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        let mut records: Vec<FiberRecord> = inner
            .fibers
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn insert_event(&self, event: &FiberEventRecord) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        inner.next_event_id += 1;
        let mut stored = event.clone();
        stored.id = Some(inner.next_event_id);
        inner.events.push(stored);
        Ok(())
    }

    async fn list_events(
        &self,
        fiber_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberEventRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.fiber_id == fiber_id)
            .skip(offset.max(0) as usize)
            .take(take_count(limit))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}
