//! Workflow domain types for Trellis.
//!
//! Defines the canonical workflow definition (steps, static and conditional
//! edges, branches, error handlers), the mutable `WorkflowState` that flows
//! through an execution, and the append-only artifacts an execution leaves
//! behind: checkpoints, decision records and error records.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved destination marking the end of a workflow.
pub const END_NODE: &str = "__end__";

/// Insertion-ordered context map (string keys to arbitrary JSON values).
pub type ContextMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// YAML files and programmatic builders both produce this struct. It is
/// immutable once compiled into a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable definition identifier (e.g. "code-review").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Ordered list of steps. Each step is one node of the graph.
    pub steps: Vec<StepDefinition>,
    /// Static edges (source -> destination).
    #[serde(default)]
    pub edges: Vec<StaticEdge>,
    /// Conditional edges (source -> {criterion value -> destination}).
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdge>,
    /// Node where execution starts.
    pub entry: String,
    /// Error-handler node per node, used once the node's retries are exhausted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_handlers: BTreeMap<String, String>,
    /// Named alternate sub-sequences. Consecutive members are chained by
    /// static edges; referencing the branch name targets its first member.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<String, Vec<String>>,
    /// Workflow-level retry configuration (steps may override `max_retries`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Optional typed schema for the workflow context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_schema: Option<ContextSchema>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A single step (node) in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step ID, unique within a workflow (e.g. "analyze").
    pub id: String,
    /// Human-readable step name. Defaults to the ID.
    #[serde(default)]
    pub name: String,
    /// Tag selecting the external executor that handles this step.
    pub kind: String,
    /// Input template. String leaves may contain `{{ context.<path> }}`
    /// placeholders resolved against the workflow context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    /// Step-level timeout in seconds (engine default when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum attempts for this step (workflow default when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl StepDefinition {
    /// Display name, falling back to the ID when no name was given.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// An unconditional edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticEdge {
    pub from: String,
    pub to: String,
}

/// A conditional edge: the next node is picked from `destinations` using the
/// first criterion source that yields a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalEdge {
    /// Source node.
    pub from: String,
    /// Criterion sources, tried in declared order.
    #[serde(default)]
    pub sources: Vec<CriterionSource>,
    /// Criterion value -> destination (node ID, branch name, or `__end__`).
    pub destinations: BTreeMap<String, String>,
    /// Destination used when the resolved value is unmapped or absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Declared set of possible criterion values (checked at compile time
    /// when there is no default).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Where a conditional edge gets its criterion value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionSource {
    /// A registered pure function of the workflow state.
    Function { name: String },
    /// A dotted path into the workflow context (e.g. "analysis.quality").
    Path { path: String },
    /// Ask an external decision oracle.
    Delegated {
        question: String,
        /// Allowed answers. Defaults to the edge's destination keys.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl CriterionSource {
    pub fn kind(&self) -> CriterionSourceKind {
        match self {
            CriterionSource::Function { .. } => CriterionSourceKind::Function,
            CriterionSource::Path { .. } => CriterionSourceKind::Path,
            CriterionSource::Delegated { .. } => CriterionSourceKind::Delegated,
        }
    }

    /// The function name, path, or question this source is keyed by.
    pub fn criterion(&self) -> &str {
        match self {
            CriterionSource::Function { name } => name,
            CriterionSource::Path { path } => path,
            CriterionSource::Delegated { question, .. } => question,
        }
    }
}

/// Discriminant of a criterion source, as recorded in decision records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionSourceKind {
    Function,
    Path,
    Delegated,
    /// Chosen explicitly by a caller through `submit_decision`.
    Manual,
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry configuration for workflow steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per node (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `initial_ms * factor^(failures - 1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        factor: f64,
        max_ms: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            initial_ms: 500,
            factor: 2.0,
            max_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Context Schema
// ---------------------------------------------------------------------------

/// Typed schema for the top-level keys of a workflow context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Accept keys that are not declared in `fields`.
    #[serde(default)]
    pub allow_unknown: bool,
}

/// Declared type and presence of one context field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default)]
    pub kind: ValueKind,
    #[serde(default)]
    pub required: bool,
}

/// JSON value kinds a context field may be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    #[default]
    Any,
}

impl ValueKind {
    /// Whether `value` is of this kind. `null` only matches `Any`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Object => value.is_object(),
            ValueKind::Array => value.is_array(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow State
// ---------------------------------------------------------------------------

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    WaitingDecision,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses never receive further checkpoints.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Error taxonomy shared by state, error records and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Definition,
    StepExecution,
    StepTimeout,
    Routing,
    Persistence,
    MaxRetriesExceeded,
    TransitionLimitExceeded,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Definition => "definition",
            ErrorKind::StepExecution => "step_execution",
            ErrorKind::StepTimeout => "step_timeout",
            ErrorKind::Routing => "routing",
            ErrorKind::Persistence => "persistence",
            ErrorKind::MaxRetriesExceeded => "max_retries_exceeded",
            ErrorKind::TransitionLimitExceeded => "transition_limit_exceeded",
        };
        f.write_str(s)
    }
}

/// Last error observed by a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub node: String,
    /// Underlying kind when `kind` summarises it (e.g. retries exhausted
    /// after repeated timeouts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorKind>,
}

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// A step completed; `content` holds its partial context.
    Step,
    /// A conditional edge picked a destination; `content` holds the record.
    Decision,
    /// A failed node was routed to its error handler.
    ErrorHandled,
}

/// One append-only entry in a workflow's message/command history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node: String,
    pub kind: HistoryKind,
    #[serde(default)]
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

/// Decision awaiting an explicit caller choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    /// Node whose conditional edge could not be resolved.
    pub node: String,
    /// Destinations the caller may choose from.
    pub options: Vec<String>,
}

/// Mutable state of one workflow execution.
///
/// Owned by exactly one engine execution while running; every persisted
/// snapshot is an immutable `Checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: Uuid,
    pub definition_id: String,
    #[serde(rename = "node")]
    pub current_node: String,
    /// Accumulated outputs of prior steps (later keys overwrite earlier ones).
    #[serde(default)]
    pub context: ContextMap,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub status: WorkflowStatus,
    /// Failed attempts per node since its last success.
    #[serde(default)]
    pub retry_counters: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_decision: Option<PendingDecision>,
    /// Set when the last checkpoint write failed; the workflow is not
    /// resumable until a write succeeds again.
    #[serde(default)]
    pub persistence_degraded: bool,
    /// Number of node executions started so far.
    #[serde(default)]
    pub transitions: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a pending state positioned at `entry`.
    pub fn new(
        workflow_id: Uuid,
        definition_id: impl Into<String>,
        entry: impl Into<String>,
        context: ContextMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            definition_id: definition_id.into(),
            current_node: entry.into(),
            context,
            history: Vec::new(),
            status: WorkflowStatus::Pending,
            retry_counters: BTreeMap::new(),
            error: None,
            pending_decision: None,
            persistence_degraded: false,
            transitions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failed attempts recorded for `node` since its last success.
    pub fn retry_count(&self, node: &str) -> u32 {
        self.retry_counters.get(node).copied().unwrap_or(0)
    }

    /// Increment and return the failure counter for `node`.
    pub fn increment_retry(&mut self, node: &str) -> u32 {
        let counter = self.retry_counters.entry(node.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset_retry(&mut self, node: &str) {
        self.retry_counters.remove(node);
    }

    /// Append a history entry stamped with the current time.
    pub fn push_history(&mut self, node: &str, kind: HistoryKind, content: Value) {
        self.history.push(HistoryEntry {
            node: node.to_string(),
            kind,
            content,
            timestamp: Utc::now(),
        });
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the latest durable checkpoint reflects this state's lineage.
    pub fn is_resumable(&self) -> bool {
        !self.persistence_degraded && !self.status.is_terminal()
    }

    /// Caller-facing summary for status queries.
    pub fn summary(&self) -> StatusSummary {
        StatusSummary {
            workflow_id: self.workflow_id,
            status: self.status,
            current_node: self.current_node.clone(),
            error: self.error.clone(),
            pending_decision: self.pending_decision.clone(),
            persistence_degraded: self.persistence_degraded,
            resumable: self.is_resumable(),
        }
    }
}

/// Summary returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub current_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_decision: Option<PendingDecision>,
    pub persistence_degraded: bool,
    pub resumable: bool,
}

// ---------------------------------------------------------------------------
// Checkpoints and audit records
// ---------------------------------------------------------------------------

/// Immutable snapshot of a `WorkflowState`.
///
/// Serialized as one flat JSON object: `sequence_number`, `timestamp` and all
/// state fields (`workflow_id`, `node`, `context`, `status`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub state: WorkflowState,
}

impl Checkpoint {
    pub fn workflow_id(&self) -> Uuid {
        self.state.workflow_id
    }

    pub fn node(&self) -> &str {
        &self.state.current_node
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.status
    }
}

/// Audit entry for one conditional-edge resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub workflow_id: Uuid,
    pub node: String,
    /// Source that produced the value, or the last source attempted when
    /// none did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion_source: Option<CriterionSourceKind>,
    /// Function name, context path or question of that source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion: Option<String>,
    pub value: Option<String>,
    /// Chosen destination. `None` while waiting or on a routing error.
    pub destination: Option<String>,
    /// Whether the destination came from the edge default.
    #[serde(default)]
    pub defaulted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Audit entry for one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub workflow_id: Uuid,
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt number that failed (1-based).
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> WorkflowState {
        let mut context = ContextMap::new();
        context.insert("topic".to_string(), json!("rust"));
        let mut state = WorkflowState::new(Uuid::now_v7(), "review", "analyze", context);
        state.status = WorkflowStatus::Running;
        state.push_history("fetch", HistoryKind::Step, json!({"files": 3}));
        state.increment_retry("analyze");
        state.error = Some(ErrorInfo {
            kind: ErrorKind::StepTimeout,
            message: "timed out".to_string(),
            node: "analyze".to_string(),
            cause: None,
        });
        state
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::WaitingDecision.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
    }

    #[test]
    fn test_retry_counters_increment_and_reset() {
        let mut state = sample_state();
        assert_eq!(state.retry_count("analyze"), 1);
        assert_eq!(state.increment_retry("analyze"), 2);
        state.reset_retry("analyze");
        assert_eq!(state.retry_count("analyze"), 0);
    }

    #[test]
    fn test_checkpoint_serializes_flat_record() {
        let checkpoint = Checkpoint {
            sequence_number: 7,
            timestamp: Utc::now(),
            state: sample_state(),
        };
        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["sequence_number"], json!(7));
        assert_eq!(value["node"], json!("analyze"));
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["context"]["topic"], json!("rust"));
        assert!(value["workflow_id"].is_string());
    }

    #[test]
    fn test_checkpoint_roundtrip_preserves_state() {
        let checkpoint = Checkpoint {
            sequence_number: 1,
            timestamp: Utc::now(),
            state: sample_state(),
        };
        let line = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&line).unwrap();
        assert_eq!(restored, checkpoint);
        assert_eq!(restored.state.history, checkpoint.state.history);
    }

    #[test]
    fn test_context_preserves_insertion_order() {
        let mut context = ContextMap::new();
        context.insert("zeta".to_string(), json!(1));
        context.insert("alpha".to_string(), json!(2));
        let keys: Vec<&String> = context.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_value_kind_matching() {
        assert!(ValueKind::Integer.matches(&json!(3)));
        assert!(!ValueKind::Integer.matches(&json!(3.5)));
        assert!(ValueKind::Number.matches(&json!(3.5)));
        assert!(ValueKind::Any.matches(&Value::Null));
        assert!(!ValueKind::String.matches(&Value::Null));
    }

    #[test]
    fn test_definition_yaml_defaults() {
        let yaml = r#"
id: review
name: Code review
entry: fetch
steps:
  - id: fetch
    kind: shell
  - id: analyze
    kind: model
    max_retries: 5
edges:
  - from: fetch
    to: analyze
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.steps[0].display_name(), "fetch");
        assert_eq!(def.steps[1].max_retries, Some(5));
        assert!(def.conditional_edges.is_empty());
        assert!(def.retry.is_none());
    }

    #[test]
    fn test_criterion_sources_are_tagged() {
        let yaml = r#"
from: review
sources:
  - type: function
    name: quality_gate
  - type: path
    path: analysis.quality
  - type: delegated
    question: Is the change safe to merge?
    timeout_secs: 10
destinations:
  yes: merge
  no: revise
default: revise
"#;
        let edge: ConditionalEdge = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(edge.sources.len(), 3);
        assert_eq!(edge.sources[0].kind(), CriterionSourceKind::Function);
        assert_eq!(edge.sources[1].criterion(), "analysis.quality");
        assert!(matches!(
            edge.sources[2],
            CriterionSource::Delegated { timeout_secs: Some(10), .. }
        ));
    }

    #[test]
    fn test_retry_config_defaults() {
        let config: RetryConfig = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff, BackoffConfig::default());

        let fixed: RetryConfig =
            serde_yaml_ng::from_str("max_retries: 2\nbackoff:\n  strategy: fixed\n  delay_ms: 10\n")
                .unwrap();
        assert_eq!(fixed.backoff, BackoffConfig::Fixed { delay_ms: 10 });
    }
}
