// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Filament engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the SQLite snapshot database
    pub database_path: PathBuf,
    /// How far ahead the wake timer is armed
    pub wake_delay: Duration,
    /// Whether to run a recovery scan at startup
    pub recover_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FILAMENT_DATABASE_PATH`: SQLite database file path
    ///
    /// Optional (with defaults):
    /// - `FILAMENT_WAKE_DELAY_MS`: wake timer delay in milliseconds (default: 30000)
    /// - `FILAMENT_RECOVER_ON_START`: run a recovery scan at startup (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("FILAMENT_DATABASE_PATH")
            .map_err(|_| ConfigError::Missing("FILAMENT_DATABASE_PATH"))?;

        let wake_delay_ms: u64 = std::env::var("FILAMENT_WAKE_DELAY_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FILAMENT_WAKE_DELAY_MS",
                    "must be a whole number of milliseconds",
                )
            })?;

        let recover_on_start: bool = std::env::var("FILAMENT_RECOVER_ON_START")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FILAMENT_RECOVER_ON_START", "must be 'true' or 'false'")
            })?;

        Ok(Self {
            database_path: PathBuf::from(database_path),
            wake_delay: Duration::from_millis(wake_delay_ms),
            recover_on_start,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
