//! In-memory session repository.

use chrono::Utc;
use dashmap::DashMap;
use trellis_types::error::RepositoryError;
use trellis_types::session::{ConversationEntry, Session, SessionStatus};
use uuid::Uuid;

use crate::repository::session::SessionRepository;

/// `DashMap`-backed [`SessionRepository`] for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: DashMap<Uuid, Session>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: &Uuid, apply: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self.sessions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        apply(&mut session);
        session.updated_at = Utc::now();
        Ok(())
    }
}

impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<(), RepositoryError> {
        if self.sessions.contains_key(&session.id) {
            return Err(RepositoryError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Session>, RepositoryError> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn attach_workflow(&self, id: &Uuid, workflow_id: &Uuid) -> Result<(), RepositoryError> {
        self.update(id, |s| {
            if !s.workflow_ids.contains(workflow_id) {
                s.workflow_ids.push(*workflow_id);
            }
        })
    }

    async fn append_entry(
        &self,
        id: &Uuid,
        entry: &ConversationEntry,
    ) -> Result<(), RepositoryError> {
        self.update(id, |s| s.history.push(entry.clone()))
    }

    async fn set_status(&self, id: &Uuid, status: SessionStatus) -> Result<(), RepositoryError> {
        self.update(id, |s| s.status = status)
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, RepositoryError> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::session::ConversationRole;

    #[tokio::test]
    async fn test_mutations_on_unknown_session_are_not_found() {
        let repo = InMemorySessionRepository::new();
        let missing = Uuid::now_v7();
        assert!(matches!(
            repo.attach_workflow(&missing, &Uuid::now_v7()).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.set_status(&missing, SessionStatus::Archived).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(repo.get(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attach_is_ordered_and_deduplicated() {
        let repo = InMemorySessionRepository::new();
        let session = Session::new();
        repo.create(&session).await.unwrap();
        assert!(matches!(
            repo.create(&session).await,
            Err(RepositoryError::Conflict(_))
        ));

        let (w1, w2) = (Uuid::now_v7(), Uuid::now_v7());
        repo.attach_workflow(&session.id, &w1).await.unwrap();
        repo.attach_workflow(&session.id, &w2).await.unwrap();
        repo.attach_workflow(&session.id, &w1).await.unwrap();
        repo.append_entry(
            &session.id,
            &ConversationEntry {
                role: ConversationRole::User,
                content: "review my diff".to_string(),
                workflow_id: None,
                timestamp: Utc::now(),
            },
        )
        .await
        .unwrap();

        let stored = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.workflow_ids, vec![w1, w2]);
        assert_eq!(stored.history.len(), 1);
        assert!(stored.updated_at >= session.updated_at);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let repo = InMemorySessionRepository::new();
        let a = Session::new();
        let b = Session::new();
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();
        repo.set_status(&b.id, SessionStatus::Archived).await.unwrap();

        let active = repo.list_sessions(Some(SessionStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        let all = repo.list_sessions(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, b.id, "most recently updated first");
    }
}
