//! Checkpoint store trait definition.
//!
//! Defines the append-only storage interface for workflow checkpoints. The
//! core crate ships an in-memory implementation; the infrastructure layer
//! (trellis-infra) implements it with JSONL files.

use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use trellis_types::error::RepositoryError;
use trellis_types::workflow::{Checkpoint, WorkflowState};
use uuid::Uuid;

/// Forward-only stream of a workflow's checkpoints in sequence order.
pub type CheckpointStream<'a> =
    Pin<Box<dyn Stream<Item = Result<Checkpoint, RepositoryError>> + Send + 'a>>;

/// Append-only checkpoint log, one per workflow ID.
///
/// Implementations must:
/// - assign strictly increasing sequence numbers per workflow ID, starting at 1
/// - make each append atomic (a partially written record is never returned)
/// - serialise appends per workflow ID without a lock shared across IDs
/// - reject appends after a terminal checkpoint with `RepositoryError::Conflict`
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Append a snapshot of `state` and return its sequence number.
    fn append(
        &self,
        state: &WorkflowState,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Most recent complete checkpoint, if any.
    fn latest(
        &self,
        workflow_id: &Uuid,
    ) -> impl Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints in sequence order. Calling again restarts from the
    /// first checkpoint.
    fn all(&self, workflow_id: Uuid) -> CheckpointStream<'_>;
}
