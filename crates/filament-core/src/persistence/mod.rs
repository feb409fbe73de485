//! Snapshot store interfaces and backends for filament-core.
//!
//! This module defines the storage abstraction the engine writes fiber
//! records through, plus the backend implementations.

/// In-memory store for tests and ephemeral setups.
pub mod memory;
/// SQLite-backed store.
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use self::memory::MemorySnapshotStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteSnapshotStore;

use crate::error::EngineError;
use crate::fiber::{FiberEventRecord, FiberRecord, FiberStatus};
use async_trait::async_trait;

/// Durable storage interface used by the engine.
///
/// Implementations must make `put_fiber` atomic per record: a concurrent
/// reader sees either the previous record or the new one, never a mix.
/// The engine only ever overwrites whole records and appends events; it
/// never deletes either.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or fully overwrite a fiber record, keyed by `fiber_id`.
    async fn put_fiber(&self, record: &FiberRecord) -> Result<(), EngineError>;

    /// Fetch one fiber record, `None` if the id is unknown.
    async fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, EngineError>;

    /// List fiber records, newest first, optionally filtered by status.
    async fn list_fibers(
        &self,
        status: Option<FiberStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberRecord>, EngineError>;

    /// List every fiber record whose status is in `statuses`, oldest first.
    ///
    /// Unpaginated on purpose: recovery must see the complete in-flight set.
    async fn list_fibers_by_status(
        &self,
        statuses: &[FiberStatus],
    ) -> Result<Vec<FiberRecord>, EngineError>;

    /// Append one event to a fiber's trail.
    async fn insert_event(&self, event: &FiberEventRecord) -> Result<(), EngineError>;

    /// List a fiber's events in append order.
    async fn list_events(
        &self,
        fiber_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberEventRecord>, EngineError>;

    /// True when the store can serve reads and writes.
    async fn health_check(&self) -> Result<bool, EngineError>;
}
