//! SQLite-backed snapshot store implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::EngineError;
use crate::fiber::{FiberEventKind, FiberEventRecord, FiberRecord, FiberStatus};

use super::SnapshotStore;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed snapshot store.
#[derive(Clone, Debug)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Create a new SQLite snapshot store from an existing pool.
    ///
    /// The caller is responsible for running migrations on the pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite snapshot store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file (e.g., ".data/fibers.db")
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteSnapshotStore::from_path(".data/fibers.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Persistence {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        // Build connection URL
        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        // Create pool with reasonable defaults
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| EngineError::Persistence {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        // Run migrations
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::Persistence {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

/// Raw fiber row as stored; JSON columns stay serialized until decode.
#[derive(sqlx::FromRow)]
struct FiberRow {
    fiber_id: String,
    step_name: String,
    payload: String,
    snapshot: Option<String>,
    status: String,
    result: Option<String>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    last_checkpoint_at: Option<DateTime<Utc>>,
}

impl TryFrom<FiberRow> for FiberRecord {
    type Error = EngineError;

    fn try_from(row: FiberRow) -> Result<Self, EngineError> {
        let status = FiberStatus::parse(&row.status).ok_or_else(|| EngineError::Persistence {
            operation: "decode".to_string(),
            details: format!(
                "unknown fiber status '{}' for fiber '{}'",
                row.status, row.fiber_id
            ),
        })?;
        Ok(FiberRecord {
            fiber_id: row.fiber_id,
            step_name: row.step_name,
            payload: serde_json::from_str(&row.payload)?,
            snapshot: row
                .snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            status,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            error: row.error,
            started_at: row.started_at,
            last_checkpoint_at: row.last_checkpoint_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    fiber_id: String,
    kind: String,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for FiberEventRecord {
    type Error = EngineError;

    fn try_from(row: EventRow) -> Result<Self, EngineError> {
        let kind = FiberEventKind::parse(&row.kind).ok_or_else(|| EngineError::Persistence {
            operation: "decode".to_string(),
            details: format!(
                "unknown event kind '{}' for fiber '{}'",
                row.kind, row.fiber_id
            ),
        })?;
        Ok(FiberEventRecord {
            id: Some(row.id),
            fiber_id: row.fiber_id,
            kind,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

#[async_trait::async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn put_fiber(&self, record: &FiberRecord) -> Result<(), EngineError> {
        let payload = serde_json::to_string(&record.payload)?;
        let snapshot = record
            .snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO fibers (fiber_id, step_name, payload, snapshot, status,
                                result, error, started_at, last_checkpoint_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fiber_id) DO UPDATE SET
                step_name=excluded.step_name,
                payload=excluded.payload,
                snapshot=excluded.snapshot,
                status=excluded.status,
                result=excluded.result,
                error=excluded.error,
                started_at=excluded.started_at,
                last_checkpoint_at=excluded.last_checkpoint_at
            "#,
        )
        .bind(&record.fiber_id)
        .bind(&record.step_name)
        .bind(payload)
        .bind(snapshot)
        .bind(record.status.as_str())
        .bind(result)
        .bind(&record.error)
        .bind(record.started_at)
        .bind(record.last_checkpoint_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, EngineError> {
        let row = sqlx::query_as::<_, FiberRow>(
            r#"
            SELECT fiber_id, step_name, payload, snapshot, status,
                   result, error, started_at, last_checkpoint_at
            FROM fibers
            WHERE fiber_id = ?
            "#,
        )
        .bind(fiber_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FiberRecord::try_from).transpose()
    }

    async fn list_fibers(
        &self,
        status: Option<FiberStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberRecord>, EngineError> {
        let rows = sqlx::query_as::<_, FiberRow>(
            r#"
            SELECT fiber_id, step_name, payload, snapshot, status,
                   result, error, started_at, last_checkpoint_at
            FROM fibers
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY started_at DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FiberRecord::try_from).collect()
    }

    async fn list_fibers_by_status(
        &self,
        statuses: &[FiberStatus],
    ) -> Result<Vec<FiberRecord>, EngineError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        // Note: IN lists cannot be bound as a single parameter, so the
        // placeholders are built here. The values come from a trusted enum,
        // so this is safe from injection.
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            r#"
            SELECT fiber_id, step_name, payload, snapshot, status,
                   result, error, started_at, last_checkpoint_at
            FROM fibers
            WHERE status IN ({placeholders})
            ORDER BY started_at ASC
            "#,
        );

        let mut q = sqlx::query_as::<_, FiberRow>(&query);
        for status in statuses {
            q = q.bind(status.as_str());
        }
        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(FiberRecord::try_from).collect()
    }

    async fn insert_event(&self, event: &FiberEventRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO fiber_events (fiber_id, kind, detail, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&event.fiber_id)
        .bind(event.kind.as_str())
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        fiber_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FiberEventRecord>, EngineError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, fiber_id, kind, detail, created_at
            FROM fiber_events
            WHERE fiber_id = ?1
            ORDER BY id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(fiber_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FiberEventRecord::try_from).collect()
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
