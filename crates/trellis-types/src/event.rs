//! Event types for the Trellis workflow event bus.
//!
//! `WorkflowEvent` is the envelope broadcast by the engine and the decision
//! router. It is Clone + Send + Sync for use with tokio broadcast channels
//! and serializes as `{ type, workflow_id, payload, timestamp }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of a workflow event. Serialized as its dotted wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.started")]
    Started,
    #[serde(rename = "workflow.completed")]
    Completed,
    #[serde(rename = "workflow.failed")]
    Failed,
    #[serde(rename = "workflow.cancelled")]
    Cancelled,
    #[serde(rename = "workflow.decision.made")]
    DecisionMade,
    #[serde(rename = "workflow.step.retrying")]
    StepRetrying,
    #[serde(rename = "workflow.step.completed")]
    StepCompleted,
    #[serde(rename = "workflow.decision.waiting")]
    DecisionWaiting,
    #[serde(rename = "workflow.persistence.degraded")]
    PersistenceDegraded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "workflow.started",
            EventType::Completed => "workflow.completed",
            EventType::Failed => "workflow.failed",
            EventType::Cancelled => "workflow.cancelled",
            EventType::DecisionMade => "workflow.decision.made",
            EventType::StepRetrying => "workflow.step.retrying",
            EventType::StepCompleted => "workflow.step.completed",
            EventType::DecisionWaiting => "workflow.decision.waiting",
            EventType::PersistenceDegraded => "workflow.persistence.degraded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, workflow_id: Uuid, payload: Value) -> Self {
        Self {
            event_type,
            workflow_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}
