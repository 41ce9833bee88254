//! Durable checkpointing for workflow execution state.
//!
//! `CheckpointWriter` wraps a `CheckpointStore` with a bounded retry policy:
//! a failed append is retried with linear backoff, and once the attempts are
//! exhausted the workflow is marked `persistence_degraded` (non-resumable)
//! instead of being aborted. `InMemoryCheckpointStore` is the store used by
//! tests and embedders that do not need durability.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::TryStreamExt;
use serde_json::json;
use thiserror::Error;
use trellis_types::error::RepositoryError;
use trellis_types::event::EventType;
use trellis_types::workflow::{Checkpoint, WorkflowState};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::checkpoint::{CheckpointStore, CheckpointStream};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("no checkpoint found for workflow: {0}")]
    NotFound(Uuid),

    /// The store refused the append (the workflow is already terminal).
    #[error("checkpoint conflict: {0}")]
    Conflict(String),

    /// Every write attempt failed; the workflow continues non-resumable.
    #[error("checkpoint write failed after {attempts} attempts: {message}")]
    Degraded { attempts: u32, message: String },
}

impl From<RepositoryError> for CheckpointError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => CheckpointError::Conflict(msg),
            other => CheckpointError::Repository(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointWriter
// ---------------------------------------------------------------------------

/// Writes checkpoints on behalf of the engine.
///
/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (JSONL files, in-memory, a failing test double).
pub struct CheckpointWriter<S: CheckpointStore> {
    store: Arc<S>,
    attempts: u32,
    backoff: Duration,
    events: EventBus,
}

impl<S: CheckpointStore> CheckpointWriter<S> {
    /// Create a writer making up to `attempts` appends per checkpoint, waiting
    /// `backoff * n` after the n-th failure.
    pub fn new(store: Arc<S>, attempts: u32, backoff: Duration, events: EventBus) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            backoff,
            events,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist a snapshot of `state`.
    ///
    /// On success `state.persistence_degraded` is cleared and the sequence
    /// number returned. After the last failed attempt the flag is set, a
    /// `workflow.persistence.degraded` event is published and
    /// `CheckpointError::Degraded` returned. Conflicts are not retried.
    pub async fn write(&self, state: &mut WorkflowState) -> Result<u64, CheckpointError> {
        let was_degraded = state.persistence_degraded;
        state.persistence_degraded = false;
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.store.append(state).await {
                Ok(seq) => {
                    if was_degraded {
                        tracing::info!(
                            workflow_id = %state.workflow_id,
                            seq,
                            "checkpoint persistence recovered"
                        );
                    }
                    tracing::debug!(
                        workflow_id = %state.workflow_id,
                        node = %state.current_node,
                        status = ?state.status,
                        seq,
                        "checkpoint written"
                    );
                    return Ok(seq);
                }
                Err(RepositoryError::Conflict(msg)) => {
                    state.persistence_degraded = was_degraded;
                    return Err(CheckpointError::Conflict(msg));
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        workflow_id = %state.workflow_id,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "checkpoint write failed"
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }

        state.persistence_degraded = true;
        self.events.emit(
            EventType::PersistenceDegraded,
            state.workflow_id,
            json!({
                "node": state.current_node,
                "attempts": self.attempts,
                "error": last_error,
            }),
        );
        Err(CheckpointError::Degraded {
            attempts: self.attempts,
            message: last_error,
        })
    }

    /// Load the latest checkpoint of a workflow.
    pub async fn restore(&self, workflow_id: &Uuid) -> Result<Checkpoint, CheckpointError> {
        self.store
            .latest(workflow_id)
            .await?
            .ok_or(CheckpointError::NotFound(*workflow_id))
    }

    /// Collect every checkpoint of a workflow in sequence order.
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.store.all(workflow_id).try_collect().await?)
    }
}

// ---------------------------------------------------------------------------
// InMemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Checkpoint store keeping every log in memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    logs: DashMap<Uuid, Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a log with existing checkpoints (e.g. copied from another store).
    pub fn with_checkpoints(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        let store = Self::new();
        for checkpoint in checkpoints {
            store
                .logs
                .entry(checkpoint.workflow_id())
                .or_default()
                .push(checkpoint);
        }
        store
    }

    /// Snapshot of a workflow's log.
    pub fn checkpoints(&self, workflow_id: &Uuid) -> Vec<Checkpoint> {
        self.logs
            .get(workflow_id)
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, state: &WorkflowState) -> Result<u64, RepositoryError> {
        let mut log = self.logs.entry(state.workflow_id).or_default();
        if let Some(last) = log.last() {
            if last.status().is_terminal() {
                return Err(RepositoryError::Conflict(format!(
                    "workflow {} is already {:?}",
                    state.workflow_id,
                    last.status()
                )));
            }
        }
        let seq = log.last().map(|c| c.sequence_number + 1).unwrap_or(1);
        log.push(Checkpoint {
            sequence_number: seq,
            timestamp: Utc::now(),
            state: state.clone(),
        });
        Ok(seq)
    }

    async fn latest(&self, workflow_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .logs
            .get(workflow_id)
            .and_then(|log| log.last().cloned()))
    }

    fn all(&self, workflow_id: Uuid) -> CheckpointStream<'_> {
        let snapshot = self.checkpoints(&workflow_id);
        Box::pin(futures_util::stream::iter(snapshot.into_iter().map(Ok)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use trellis_types::workflow::{ContextMap, WorkflowStatus};

    /// Store that fails the first `failures` appends before delegating.
    struct FlakyStore {
        inner: InMemoryCheckpointStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryCheckpointStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl CheckpointStore for FlakyStore {
        async fn append(&self, state: &WorkflowState) -> Result<u64, RepositoryError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RepositoryError::Query("disk full".to_string()));
            }
            self.inner.append(state).await
        }

        async fn latest(&self, workflow_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
            self.inner.latest(workflow_id).await
        }

        fn all(&self, workflow_id: Uuid) -> CheckpointStream<'_> {
            self.inner.all(workflow_id)
        }
    }

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new(Uuid::now_v7(), "wf", "a", ContextMap::new());
        state.status = WorkflowStatus::Running;
        state
    }

    fn writer<S: CheckpointStore>(store: S, events: EventBus) -> CheckpointWriter<S> {
        CheckpointWriter::new(Arc::new(store), 3, Duration::ZERO, events)
    }

    // -----------------------------------------------------------------------
    // InMemoryCheckpointStore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_sequence_numbers_strictly_increase() {
        let store = InMemoryCheckpointStore::new();
        let mut state = state();
        assert_eq!(store.append(&state).await.unwrap(), 1);
        state.current_node = "b".to_string();
        assert_eq!(store.append(&state).await.unwrap(), 2);

        let latest = store.latest(&state.workflow_id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 2);
        assert_eq!(latest.node(), "b");
    }

    #[tokio::test]
    async fn test_append_after_terminal_conflicts() {
        let store = InMemoryCheckpointStore::new();
        let mut state = state();
        state.status = WorkflowStatus::Completed;
        store.append(&state).await.unwrap();
        let err = store.append(&state).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_all_is_restartable() {
        let store = InMemoryCheckpointStore::new();
        let state = state();
        store.append(&state).await.unwrap();
        store.append(&state).await.unwrap();

        let first: Vec<Checkpoint> = store.all(state.workflow_id).try_collect().await.unwrap();
        let second: Vec<Checkpoint> = store.all(state.workflow_id).try_collect().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        let empty: Vec<Checkpoint> = store.all(Uuid::now_v7()).try_collect().await.unwrap();
        assert!(empty.is_empty());
    }

    // -----------------------------------------------------------------------
    // CheckpointWriter
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_writer_retries_transient_failures() {
        let writer = writer(FlakyStore::new(2), EventBus::new(8));
        let mut state = state();
        let seq = writer.write(&mut state).await.unwrap();
        assert_eq!(seq, 1);
        assert!(!state.persistence_degraded);
    }

    #[tokio::test]
    async fn test_writer_degrades_after_exhaustion() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let writer = writer(FlakyStore::new(3), events);
        let mut state = state();

        let err = writer.write(&mut state).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Degraded { attempts: 3, .. }), "got: {err}");
        assert!(state.persistence_degraded);
        assert!(!state.is_resumable());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::PersistenceDegraded);
        assert_eq!(event.workflow_id, state.workflow_id);

        // Next successful write clears the flag and persists it cleared.
        writer.write(&mut state).await.unwrap();
        assert!(!state.persistence_degraded);
        let latest = writer.restore(&state.workflow_id).await.unwrap();
        assert!(!latest.state.persistence_degraded);
    }

    #[tokio::test]
    async fn test_writer_does_not_retry_conflicts() {
        let writer = writer(InMemoryCheckpointStore::new(), EventBus::new(8));
        let mut state = state();
        state.status = WorkflowStatus::Failed;
        writer.write(&mut state).await.unwrap();
        let err = writer.write(&mut state).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict(_)), "got: {err}");
        assert_eq!(writer.history(state.workflow_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_missing_workflow() {
        let writer = writer(InMemoryCheckpointStore::new(), EventBus::new(8));
        let id = Uuid::now_v7();
        let err = writer.restore(&id).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(missing) if missing == id));
    }
}
