//! Step executor port and registry.
//!
//! A `StepExecutor` runs one named step against a snapshot of the workflow
//! and returns a partial context, or an error. The engine picks the executor
//! by the step's `kind`:
//! 1. `StepExecutor` is the RPITIT trait implementors write
//! 2. `StepExecutorDyn` is its object-safe twin, blanket-implemented for all `T: StepExecutor`
//! 3. `BoxStepExecutor` wraps `Box<dyn StepExecutorDyn>` and delegates
//!
//! `ExecutorRegistry` maps kinds to executors and is shared read-only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use trellis_types::workflow::{ContextMap, HistoryEntry, StepDefinition};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation / result types
// ---------------------------------------------------------------------------

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub workflow_id: Uuid,
    pub step: StepDefinition,
    /// The step's input template, resolved against the current context.
    pub input: Value,
    /// Context snapshot taken before the attempt.
    pub context: ContextMap,
    pub history: Vec<HistoryEntry>,
    /// 1-based attempt number for this node.
    pub attempt: u32,
    /// Cancelled when the workflow is cancelled. Executors may honour it;
    /// their result is discarded either way.
    pub cancel: CancellationToken,
}

/// Partial context produced by a successful step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub updates: ContextMap,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one key to the partial context.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.updates.insert(key.into(), value);
        self
    }

    /// Build from a JSON value; objects become the partial context, any
    /// other value is stored under `output`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(updates) => Self { updates },
            Value::Null => Self::default(),
            other => Self::default().with("output", other),
        }
    }
}

/// Errors an executor can report.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Retryable failure.
    #[error("step failed: {0}")]
    Failed(String),

    /// Failure that retrying cannot fix; goes straight to the handler or fails.
    #[error("fatal step error: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// StepExecutor trait + dynamic dispatch
// ---------------------------------------------------------------------------

/// Runs steps of one or more kinds.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        invocation: StepInvocation,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed(
        &self,
        invocation: StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send + '_>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed(
        &self,
        invocation: StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send + '_>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased step executor for runtime registration by kind.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, invocation: StepInvocation) -> Result<StepOutput, StepError> {
        self.inner.execute_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

/// Executor backed by an async closure.
pub struct FnStepExecutor<F> {
    func: F,
}

impl<F, Fut> FnStepExecutor<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> StepExecutor for FnStepExecutor<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    fn execute(
        &self,
        invocation: StepInvocation,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send {
        (self.func)(invocation)
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Step kind -> executor map, built before the engine and shared read-only.
#[derive(Debug, Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<BoxStepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `kind`, replacing any previous one.
    pub fn register<T: StepExecutor + 'static>(&mut self, kind: impl Into<String>, executor: T) {
        self.executors
            .insert(kind.into(), Arc::new(BoxStepExecutor::new(executor)));
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<T: StepExecutor + 'static>(mut self, kind: impl Into<String>, executor: T) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<BoxStepExecutor>> {
        self.executors.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
