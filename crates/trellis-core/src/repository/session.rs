//! Session repository trait definition.
//!
//! Defines the storage interface for sessions, their attached workflows and
//! conversation history. The infrastructure layer (trellis-infra) implements
//! this trait with SQLite persistence.

use std::future::Future;

use trellis_types::error::RepositoryError;
use trellis_types::session::{ConversationEntry, Session, SessionStatus};
use uuid::Uuid;

/// Repository trait for session persistence.
///
/// Mutating calls on an unknown session return `RepositoryError::NotFound`
/// and bump the session's `updated_at` on success.
pub trait SessionRepository: Send + Sync {
    fn create(&self, session: &Session) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get(&self, id: &Uuid) -> impl Future<Output = Result<Option<Session>, RepositoryError>> + Send;

    /// Append a workflow ID to the session's ordered workflow list.
    fn attach_workflow(
        &self,
        id: &Uuid,
        workflow_id: &Uuid,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn append_entry(
        &self,
        id: &Uuid,
        entry: &ConversationEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn set_status(
        &self,
        id: &Uuid,
        status: SessionStatus,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// List sessions, optionally filtered by status, most recently updated first.
    fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> impl Future<Output = Result<Vec<Session>, RepositoryError>> + Send;
}
