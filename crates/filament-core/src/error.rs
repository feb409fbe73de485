// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for filament-core.

use crate::fiber::FiberStatus;
use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// No step was registered under the requested name.
    #[error("no step registered under name '{name}'")]
    UnknownStep {
        /// The step name that failed to resolve.
        name: String,
    },

    /// The fiber already has a live runner in this process.
    #[error("fiber '{fiber_id}' already has an active runner")]
    AlreadyRunning {
        /// The fiber that is already claimed.
        fiber_id: String,
    },

    /// No fiber record exists under the given id.
    #[error("fiber '{fiber_id}' not found")]
    NotFound {
        /// The fiber id that was not found.
        fiber_id: String,
    },

    /// The fiber has settled and cannot transition again.
    #[error("fiber '{fiber_id}' is terminal ({status})")]
    Terminal {
        /// The fiber id.
        fiber_id: String,
        /// The terminal status the fiber settled in.
        status: FiberStatus,
    },

    /// The snapshot store failed.
    #[error("persistence error during '{operation}': {details}")]
    Persistence {
        /// The store operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownStep { .. } => "UNKNOWN_STEP",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Terminal { .. } => "TERMINAL",
            Self::Persistence { .. } => "PERSISTENCE_ERROR",
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Persistence {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
