//! Session manager.
//!
//! Groups workflows and conversation history into sessions and drives the
//! engine on their behalf. A session's most recent workflow is the one that
//! `resume` continues; ending a session cancels its unfinished workflows and
//! seals them against further runs.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use trellis_types::error::RepositoryError;
use trellis_types::session::{ConversationEntry, ConversationRole, Session, SessionStatus};
use trellis_types::workflow::{ContextMap, WorkflowDefinition, WorkflowState};
use uuid::Uuid;

use crate::repository::checkpoint::CheckpointStore;
use crate::repository::session::SessionRepository;
use crate::workflow::executor::{EngineError, GraphEngine};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(Uuid),

    #[error("session {0} is archived")]
    Archived(Uuid),

    #[error("session {0} has no workflow")]
    NoWorkflow(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A workflow spawned by [`SessionManager::start_workflow`].
#[derive(Debug)]
pub struct StartedWorkflow {
    pub workflow_id: Uuid,
    pub handle: JoinHandle<Result<WorkflowState, EngineError>>,
}

/// Session lifecycle on top of a [`GraphEngine`].
///
/// Generic over repository and store traits to maintain clean
/// architecture -- trellis-core never depends on trellis-infra.
pub struct SessionManager<R: SessionRepository, S: CheckpointStore> {
    repo: R,
    engine: Arc<GraphEngine<S>>,
}

impl<R: SessionRepository, S: CheckpointStore + 'static> SessionManager<R, S> {
    pub fn new(repo: R, engine: Arc<GraphEngine<S>>) -> Self {
        Self { repo, engine }
    }

    pub fn engine(&self) -> &Arc<GraphEngine<S>> {
        &self.engine
    }

    pub async fn create_session(&self) -> Result<Session, SessionError> {
        let session = Session::new();
        self.repo.create(&session).await?;
        tracing::info!(session_id = %session.id, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session, SessionError> {
        self.repo
            .get(&id)
            .await?
            .ok_or(SessionError::NotFound(id))
    }

    /// Load a session that still accepts work.
    async fn active(&self, id: Uuid) -> Result<Session, SessionError> {
        let session = self.get_session(id).await?;
        if session.is_archived() {
            return Err(SessionError::Archived(id));
        }
        Ok(session)
    }

    /// Attach an existing workflow; it becomes the session's most recent one.
    pub async fn attach_workflow(
        &self,
        session_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<(), SessionError> {
        self.active(session_id).await?;
        self.repo.attach_workflow(&session_id, &workflow_id).await?;
        tracing::debug!(session_id = %session_id, workflow_id = %workflow_id, "workflow attached");
        Ok(())
    }

    /// Create a workflow, attach it and spawn its execution.
    pub async fn start_workflow(
        &self,
        session_id: Uuid,
        definition: &WorkflowDefinition,
        initial_context: ContextMap,
    ) -> Result<StartedWorkflow, SessionError> {
        self.active(session_id).await?;
        let workflow_id = self
            .engine
            .create_workflow(definition, initial_context)
            .map_err(EngineError::from)?;
        self.repo.attach_workflow(&session_id, &workflow_id).await?;
        let handle = self.engine.start(workflow_id)?;
        tracing::info!(
            session_id = %session_id,
            workflow_id = %workflow_id,
            definition_id = %definition.id,
            "workflow started for session"
        );
        Ok(StartedWorkflow {
            workflow_id,
            handle,
        })
    }

    /// Append a conversation entry, linked to the session's latest workflow.
    pub async fn append_conversation(
        &self,
        session_id: Uuid,
        role: ConversationRole,
        content: impl Into<String>,
    ) -> Result<ConversationEntry, SessionError> {
        let session = self.active(session_id).await?;
        let entry = ConversationEntry {
            role,
            content: content.into(),
            workflow_id: session.latest_workflow(),
            timestamp: Utc::now(),
        };
        self.repo.append_entry(&session_id, &entry).await?;
        Ok(entry)
    }

    /// Continue the session's most recent workflow from its latest checkpoint.
    pub async fn resume(&self, session_id: Uuid) -> Result<WorkflowState, SessionError> {
        let session = self.active(session_id).await?;
        let workflow_id = session
            .latest_workflow()
            .ok_or(SessionError::NoWorkflow(session_id))?;
        tracing::info!(session_id = %session_id, workflow_id = %workflow_id, "resuming session");
        Ok(self.engine.resume_workflow(workflow_id).await?)
    }

    /// Archive a session, cancel its unfinished workflows and seal them.
    ///
    /// Running workflows are awaited until they stop, and every workflow is
    /// left with a terminal checkpoint, so no engine over the same store can
    /// resume them later. Ending an archived session is a no-op.
    pub async fn end_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        let session = self.get_session(session_id).await?;
        if session.is_archived() {
            return Ok(());
        }

        for workflow_id in &session.workflow_ids {
            match self.engine.cancel_and_wait(*workflow_id).await {
                Ok(()) => {}
                Err(EngineError::Terminal { .. } | EngineError::UnknownWorkflow(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        workflow_id = %workflow_id,
                        error = %e,
                        "failed to cancel workflow while ending session"
                    );
                }
            }
            if let Err(e) = self.engine.seal(*workflow_id).await {
                tracing::warn!(
                    session_id = %session_id,
                    workflow_id = %workflow_id,
                    error = %e,
                    "failed to persist workflow seal"
                );
            }
        }

        self.repo
            .set_status(&session_id, SessionStatus::Archived)
            .await?;
        tracing::info!(
            session_id = %session_id,
            workflows = session.workflow_ids.len(),
            "session ended"
        );
        Ok(())
    }

    /// End every active session idle for longer than `max_idle`.
    ///
    /// Returns the IDs of the archived sessions.
    pub async fn archive_inactive(
        &self,
        max_idle: chrono::Duration,
    ) -> Result<Vec<Uuid>, SessionError> {
        let cutoff = Utc::now() - max_idle;
        let idle: Vec<Uuid> = self
            .repo
            .list_sessions(Some(SessionStatus::Active))
            .await?
            .into_iter()
            .filter(|s| s.updated_at < cutoff)
            .map(|s| s.id)
            .collect();

        for id in &idle {
            self.end_session(*id).await?;
        }
        if !idle.is_empty() {
            tracing::info!(count = idle.len(), "archived inactive sessions");
        }
        Ok(idle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
