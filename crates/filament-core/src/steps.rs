// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step definitions and the name-to-step registry.
//!
//! A step is the unit of durable work: the engine invokes it with a
//! [`StepContext`](crate::runner::StepContext) and persists whatever it
//! stashes. Steps are registered under stable names; fiber records store
//! only the name, so a restarted process can resolve the same step again
//! as long as it registers it under the same name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::runner::StepContext;

/// A named unit of durable work.
///
/// Implementations must be prepared to be invoked more than once for the
/// same fiber: after a crash the engine re-invokes the step with the last
/// stashed snapshot, and everything since that snapshot runs again.
#[async_trait]
pub trait Step: Send + Sync {
    /// Execute the step. The returned value becomes the fiber's result.
    async fn run(&self, ctx: StepContext) -> anyhow::Result<Value>;
}

struct FnStep<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: StepContext) -> anyhow::Result<Value> {
        (self.f)(ctx).await
    }
}

/// Registry mapping step names to step implementations.
///
/// Populated before the runtime starts; the engine resolves names against
/// it on spawn and on restart.
///
/// # Example
///
/// ```
/// use filament_core::StepRegistry;
///
/// let mut steps = StepRegistry::new();
/// steps.register_fn("greet", |ctx| async move {
///     Ok(serde_json::json!({ "hello": ctx.payload() }))
/// });
/// assert!(steps.contains("greet"));
/// ```
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, step: impl Step + 'static) {
        self.steps.insert(name.into(), Arc::new(step));
    }

    /// Register an async closure as a step.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, FnStep { f });
    }

    /// Resolve a step by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    /// True when a step is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when no steps are registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}
