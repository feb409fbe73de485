// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable fiber runtime: the engine plus its background wake driver.
//!
//! [`FiberRuntime`] hosts a [`FiberEngine`] inside an existing tokio
//! application. The builder picks the snapshot store, the step registry,
//! and the recovery hook; [`FiberRuntimeConfig::start`] runs the startup
//! recovery scan and spawns the wake driver, a task that sleeps until the
//! wake deadline and runs recovery scans until shutdown.
//!
//! ```rust,ignore
//! let runtime = FiberRuntime::builder()
//!     .store(Arc::new(SqliteSnapshotStore::from_path("fibers.db").await?))
//!     .steps(steps)
//!     .recovery_hook(hook_fn(|_| async { Ok(RecoveryDecision::Restart) }))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let fiber_id = runtime.engine().spawn_fiber("sync-orders", json!({})).await?;
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::FiberEngine;
use crate::persistence::SnapshotStore;
use crate::recovery::{LeaveAll, RecoveryHook};
use crate::steps::StepRegistry;

/// Builder for creating a [`FiberRuntime`].
pub struct FiberRuntimeBuilder {
    store: Option<Arc<dyn SnapshotStore>>,
    steps: StepRegistry,
    hook: Arc<dyn RecoveryHook>,
    wake_delay: Duration,
    recover_on_start: bool,
    wake_driver: bool,
}

impl std::fmt::Debug for FiberRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("steps", &self.steps)
            .field("wake_delay", &self.wake_delay)
            .field("recover_on_start", &self.recover_on_start)
            .field("wake_driver", &self.wake_driver)
            .finish()
    }
}

impl Default for FiberRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            steps: StepRegistry::new(),
            hook: Arc::new(LeaveAll),
            wake_delay: Duration::from_secs(30),
            recover_on_start: true,
            wake_driver: true,
        }
    }
}

impl FiberRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot store (required).
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the step registry fiber spawns are resolved against.
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    /// Set the hook consulted for orphaned fibers.
    ///
    /// Defaults to [`LeaveAll`].
    pub fn recovery_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Set how far ahead the wake timer is armed.
    ///
    /// Defaults to 30 seconds.
    pub fn wake_delay(mut self, delay: Duration) -> Self {
        self.wake_delay = delay;
        self
    }

    /// Run a recovery scan during [`FiberRuntimeConfig::start`].
    ///
    /// Defaults to `true`.
    pub fn recover_on_start(mut self, enabled: bool) -> Self {
        self.recover_on_start = enabled;
        self
    }

    /// Spawn the background wake driver.
    ///
    /// With `false` the owner must call
    /// [`FiberEngine::run_recovery_scan`] itself. Defaults to `true`.
    pub fn wake_driver(mut self, enabled: bool) -> Self {
        self.wake_driver = enabled;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> Result<FiberRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("snapshot store is required"))?;

        Ok(FiberRuntimeConfig {
            store,
            steps: self.steps,
            hook: self.hook,
            wake_delay: self.wake_delay,
            recover_on_start: self.recover_on_start,
            wake_driver: self.wake_driver,
        })
    }
}

/// Validated runtime configuration, ready to start.
pub struct FiberRuntimeConfig {
    store: Arc<dyn SnapshotStore>,
    steps: StepRegistry,
    hook: Arc<dyn RecoveryHook>,
    wake_delay: Duration,
    recover_on_start: bool,
    wake_driver: bool,
}

impl std::fmt::Debug for FiberRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRuntimeConfig")
            .field("store", &"...")
            .field("steps", &self.steps)
            .field("wake_delay", &self.wake_delay)
            .field("recover_on_start", &self.recover_on_start)
            .field("wake_driver", &self.wake_driver)
            .finish()
    }
}

impl FiberRuntimeConfig {
    /// Start the runtime.
    ///
    /// Builds the engine, runs the startup recovery scan when enabled, and
    /// spawns the wake driver task.
    pub async fn start(self) -> Result<FiberRuntime> {
        let engine = FiberEngine::new(self.store, self.steps, self.hook, self.wake_delay);

        if self.recover_on_start {
            let report = engine.run_recovery_scan().await?;
            info!(
                scanned = report.scanned,
                restarted = report.restarted,
                left = report.left,
                "Startup recovery scan finished"
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver_handle = self
            .wake_driver
            .then(|| tokio::spawn(run_wake_driver(engine.clone(), shutdown_rx)));

        info!("FiberRuntime started");

        Ok(FiberRuntime {
            engine,
            driver_handle,
            shutdown_tx,
        })
    }
}

/// Handle to a running fiber runtime.
pub struct FiberRuntime {
    engine: FiberEngine,
    driver_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl FiberRuntime {
    /// Create a builder for configuring the runtime.
    pub fn builder() -> FiberRuntimeBuilder {
        FiberRuntimeBuilder::new()
    }

    /// Handle for spawning and managing fibers.
    pub fn engine(&self) -> &FiberEngine {
        &self.engine
    }

    /// Whether the wake driver task is still running.
    ///
    /// Always `true` when the runtime was started without one.
    pub fn is_running(&self) -> bool {
        match &self.driver_handle {
            Some(handle) => !handle.is_finished(),
            None => true,
        }
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the wake driver, then aborts live runner tasks. Aborted fibers
    /// keep their last stashed snapshot and are reported as orphans by the
    /// next process's recovery scan.
    pub async fn shutdown(self) -> Result<()> {
        info!("FiberRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.driver_handle {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!("Wake driver task panicked: {}", e);
                    return Err(anyhow::anyhow!("wake driver task panicked: {e}"));
                }
            }
        }

        let aborted = self.engine.abort_active_runners();
        if aborted > 0 {
            info!(aborted, "Aborted live runners; their fibers stay in flight");
        }

        info!("FiberRuntime shutdown complete");
        Ok(())
    }
}

/// Sleep until the wake deadline, run a recovery scan, repeat.
async fn run_wake_driver(engine: FiberEngine, mut shutdown_rx: watch::Receiver<bool>) {
    info!("Wake driver started");
    let mut wake_rx = engine.subscribe_wake();

    loop {
        let deadline = *wake_rx.borrow_and_update();

        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                // A dropped runtime handle counts as shutdown.
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("Wake driver received shutdown signal");
                    break;
                }
            }

            result = wake_rx.changed() => {
                if result.is_err() {
                    break;
                }
                // Deadline moved; go around and re-sleep against it.
            }

            _ = wait_until(deadline) => {
                if let Err(e) = engine.run_recovery_scan().await {
                    error!(error = %e, "Recovery scan failed");
                    // Retry one delay from now instead of spinning on the error.
                    engine.rearm_wake();
                }
            }
        }
    }

    info!("Wake driver stopped");
}

/// Resolve at `deadline`; never resolve while the timer is disarmed.
async fn wait_until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending::<()>().await,
    }
}
