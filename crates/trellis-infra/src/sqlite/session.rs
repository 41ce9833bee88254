//! SQLite session repository implementation.
//!
//! Implements `SessionRepository` from `trellis-core` using sqlx with split
//! read/write pools. Attached workflows and conversation entries live in
//! child tables ordered by position and insertion.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use trellis_core::repository::session::SessionRepository;
use trellis_types::error::RepositoryError;
use trellis_types::session::{ConversationEntry, ConversationRole, Session, SessionStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SessionRepository`.
pub struct SqliteSessionRepository {
    pool: DatabasePool,
}

impl SqliteSessionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Bump `updated_at`, failing with `NotFound` for an unknown session.
    async fn touch(
        conn: &mut sqlx::SqliteConnection,
        id: &Uuid,
        now: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id.to_string())
            .execute(conn)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SessionRow {
    id: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_session(
        self,
        workflow_ids: Vec<Uuid>,
        history: Vec<ConversationEntry>,
    ) -> Result<Session, RepositoryError> {
        Ok(Session {
            id: parse_uuid(&self.id)?,
            workflow_ids,
            history,
            status: self
                .status
                .parse::<SessionStatus>()
                .map_err(RepositoryError::Query)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct EntryRow {
    role: String,
    content: String,
    workflow_id: Option<String>,
    timestamp: String,
}

impl EntryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            workflow_id: row.try_get("workflow_id")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    fn into_entry(self) -> Result<ConversationEntry, RepositoryError> {
        Ok(ConversationEntry {
            role: self
                .role
                .parse::<ConversationRole>()
                .map_err(RepositoryError::Query)?,
            content: self.content,
            workflow_id: self.workflow_id.as_deref().map(parse_uuid).transpose()?,
            timestamp: parse_datetime(&self.timestamp)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that lexical order is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// SessionRepository impl
// ---------------------------------------------------------------------------

impl SessionRepository for SqliteSessionRepository {
    async fn create(&self, session: &Session) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            "INSERT INTO sessions (id, status, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.status.to_string())
        .bind(format_datetime(&session.created_at))
        .bind(format_datetime(&session.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            let duplicate = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            if duplicate {
                RepositoryError::Conflict(format!("session {} already exists", session.id))
            } else {
                query_error(e)
            }
        })?;

        for (position, workflow_id) in session.workflow_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO session_workflows (session_id, workflow_id, position, attached_at) VALUES (?, ?, ?, ?)",
            )
            .bind(session.id.to_string())
            .bind(workflow_id.to_string())
            .bind(position as i64)
            .bind(format_datetime(&session.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }
        for entry in &session.history {
            insert_entry(&mut tx, &session.id, entry).await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query("SELECT id, status, created_at, updated_at FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let session_row = SessionRow::from_row(&row).map_err(query_error)?;

        let workflow_rows = sqlx::query(
            "SELECT workflow_id FROM session_workflows WHERE session_id = ? ORDER BY position ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        let mut workflow_ids = Vec::with_capacity(workflow_rows.len());
        for row in &workflow_rows {
            let raw: String = row.try_get("workflow_id").map_err(query_error)?;
            workflow_ids.push(parse_uuid(&raw)?);
        }

        let entry_rows = sqlx::query(
            "SELECT role, content, workflow_id, timestamp FROM conversation_entries WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        let mut history = Vec::with_capacity(entry_rows.len());
        for row in &entry_rows {
            let entry = EntryRow::from_row(row).map_err(query_error)?;
            history.push(entry.into_entry()?);
        }

        Ok(Some(session_row.into_session(workflow_ids, history)?))
    }

    async fn attach_workflow(&self, id: &Uuid, workflow_id: &Uuid) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        Self::touch(&mut *tx, id, &now).await?;

        sqlx::query(
            r#"INSERT OR IGNORE INTO session_workflows (session_id, workflow_id, position, attached_at)
               VALUES (?, ?, (SELECT COALESCE(MAX(position), -1) + 1 FROM session_workflows WHERE session_id = ?), ?)"#,
        )
        .bind(id.to_string())
        .bind(workflow_id.to_string())
        .bind(id.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn append_entry(
        &self,
        id: &Uuid,
        entry: &ConversationEntry,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        Self::touch(&mut *tx, id, &now).await?;
        insert_entry(&mut tx, id, entry).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn set_status(&self, id: &Uuid, status: SessionStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT id FROM sessions WHERE status = ? ORDER BY updated_at DESC")
                    .bind(status.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT id FROM sessions ORDER BY updated_at DESC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.try_get("id").map_err(query_error)?;
            if let Some(session) = self.get(&parse_uuid(&raw)?).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &Uuid,
    entry: &ConversationEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO conversation_entries (session_id, role, content, workflow_id, timestamp) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(session_id.to_string())
    .bind(entry.role.to_string())
    .bind(&entry.content)
    .bind(entry.workflow_id.map(|w| w.to_string()))
    .bind(format_datetime(&entry.timestamp))
    .execute(&mut **tx)
    .await
    .map_err(query_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> (tempfile::TempDir, SqliteSessionRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("sessions.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteSessionRepository::new(pool))
    }

    fn entry(role: ConversationRole, content: &str, workflow_id: Option<Uuid>) -> ConversationEntry {
        ConversationEntry {
            role,
            content: content.to_string(),
            workflow_id,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let (_dir, repo) = repo().await;
        let session = Session::new();
        repo.create(&session).await.unwrap();

        let stored = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.id, session.id);
        assert_eq!(stored.status, SessionStatus::Active);
        assert!(stored.workflow_ids.is_empty());
        assert_eq!(
            stored.created_at.timestamp_micros(),
            session.created_at.timestamp_micros()
        );

        let err = repo.create(&session).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)), "got: {err}");
        assert!(repo.get(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_workflows_keep_attach_order() {
        let (_dir, repo) = repo().await;
        let session = Session::new();
        repo.create(&session).await.unwrap();

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::now_v7()).collect();
        for id in &ids {
            repo.attach_workflow(&session.id, id).await.unwrap();
        }
        repo.attach_workflow(&session.id, &ids[0]).await.unwrap();

        let stored = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.workflow_ids, ids);
        assert_eq!(stored.latest_workflow(), Some(ids[2]));
        assert!(stored.updated_at >= stored.created_at);
    }

    #[tokio::test]
    async fn test_conversation_history_in_order() {
        let (_dir, repo) = repo().await;
        let session = Session::new();
        repo.create(&session).await.unwrap();
        let workflow_id = Uuid::now_v7();

        repo.append_entry(&session.id, &entry(ConversationRole::User, "review PR 42", None))
            .await
            .unwrap();
        repo.append_entry(
            &session.id,
            &entry(ConversationRole::Assistant, "started review", Some(workflow_id)),
        )
        .await
        .unwrap();

        let stored = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.history[0].role, ConversationRole::User);
        assert_eq!(stored.history[1].content, "started review");
        assert_eq!(stored.history[1].workflow_id, Some(workflow_id));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (_dir, repo) = repo().await;
        let missing = Uuid::now_v7();
        assert!(matches!(
            repo.attach_workflow(&missing, &Uuid::now_v7()).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.append_entry(&missing, &entry(ConversationRole::User, "hi", None)).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.set_status(&missing, SessionStatus::Archived).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_sessions_filters_and_orders() {
        let (_dir, repo) = repo().await;
        let older = Session::new();
        let newer = Session::new();
        repo.create(&older).await.unwrap();
        repo.create(&newer).await.unwrap();
        repo.attach_workflow(&older.id, &Uuid::now_v7()).await.unwrap();
        repo.set_status(&newer.id, SessionStatus::Archived).await.unwrap();

        let active = repo.list_sessions(Some(SessionStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, older.id);
        assert_eq!(active[0].workflow_ids.len(), 1);

        let all = repo.list_sessions(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, newer.id, "most recently updated first");
        assert_eq!(all[0].status, SessionStatus::Archived);
    }
}
