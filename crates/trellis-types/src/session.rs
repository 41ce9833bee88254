//! Session types for Trellis.
//!
//! A session groups the workflows started on behalf of one caller together
//! with the conversation that led to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a session.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (status IN ('active', 'archived'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Archived,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(format!("invalid session status: '{other}'")),
        }
    }
}

/// Author of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for ConversationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationRole::User => write!(f, "user"),
            ConversationRole::Assistant => write!(f, "assistant"),
            ConversationRole::System => write!(f, "system"),
        }
    }
}

impl FromStr for ConversationRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(ConversationRole::User),
            "assistant" => Ok(ConversationRole::Assistant),
            "system" => Ok(ConversationRole::System),
            other => Err(format!("invalid conversation role: '{other}'")),
        }
    }
}

/// One entry of a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub content: String,
    /// Workflow the entry refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// A conversation session and the workflows attached to it.
///
/// `workflow_ids` is ordered by attach time; the last entry is the session's
/// most recent workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(default)]
    pub workflow_ids: Vec<Uuid>,
    #[serde(default)]
    pub history: Vec<ConversationEntry>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_ids: Vec::new(),
            history: Vec::new(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn latest_workflow(&self) -> Option<Uuid> {
        self.workflow_ids.last().copied()
    }

    pub fn is_archived(&self) -> bool {
        self.status == SessionStatus::Archived
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_display_and_parse() {
        for status in [SessionStatus::Active, SessionStatus::Archived] {
            let s = status.to_string();
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("closed".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_session_status_serde() {
        let json = serde_json::to_string(&SessionStatus::Archived).unwrap();
        assert_eq!(json, "\"archived\"");
        assert_eq!(SessionStatus::default(), SessionStatus::Active);
    }

    #[test]
    fn test_conversation_role_parse_case_insensitive() {
        assert_eq!(
            "Assistant".parse::<ConversationRole>().unwrap(),
            ConversationRole::Assistant
        );
        assert!("tool".parse::<ConversationRole>().is_err());
    }

    #[test]
    fn test_latest_workflow_is_last_attached() {
        let mut session = Session::new();
        assert!(session.latest_workflow().is_none());
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        session.workflow_ids.push(first);
        session.workflow_ids.push(second);
        assert_eq!(session.latest_workflow(), Some(second));
        assert!(!session.is_archived());
    }
}
