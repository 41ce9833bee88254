//! Decision router for conditional edges.
//!
//! Resolves the next node of a conditional edge by trying its criterion
//! sources in declared order (registered functions, context paths, a
//! delegated oracle) and mapping the first value through the edge's
//! destination table. Every resolution is kept as a `DecisionRecord`;
//! `detect_decision_patterns` summarises a slice of records per node.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use trellis_types::event::EventType;
use trellis_types::workflow::{
    ConditionalEdge, ContextMap, CriterionSource, CriterionSourceKind, DecisionRecord,
    WorkflowState,
};
use uuid::Uuid;

use super::context::{criterion_key, lookup_path};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Function criteria
// ---------------------------------------------------------------------------

/// A pure decision function over the workflow state.
pub type DecisionFn = Arc<dyn Fn(&WorkflowState) -> Option<String> + Send + Sync>;

/// Named decision functions, built before the engine and shared read-only.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, DecisionFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&WorkflowState) -> Option<String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
    }

    pub fn with<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&WorkflowState) -> Option<String> + Send + Sync + 'static,
    {
        self.register(name, func);
        self
    }

    pub fn get(&self, name: &str) -> Option<&DecisionFn> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Decision oracle
// ---------------------------------------------------------------------------

/// A question put to an external decision oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub workflow_id: Uuid,
    pub node: String,
    pub question: String,
    pub options: Vec<String>,
    pub context: ContextMap,
}

/// An oracle's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleAnswer {
    Choice(String),
    /// The oracle declined to choose.
    NoAnswer,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle failed: {0}")]
    Failed(String),
}

/// External "which branch should we take?" strategy.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DecisionOracle: Send + Sync {
    fn ask(
        &self,
        request: OracleRequest,
    ) -> impl Future<Output = Result<OracleAnswer, OracleError>> + Send;
}

/// Object-safe version of [`DecisionOracle`] with boxed futures.
pub trait DecisionOracleDyn: Send + Sync {
    fn ask_boxed(
        &self,
        request: OracleRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OracleAnswer, OracleError>> + Send + '_>>;
}

impl<T: DecisionOracle> DecisionOracleDyn for T {
    fn ask_boxed(
        &self,
        request: OracleRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OracleAnswer, OracleError>> + Send + '_>> {
        Box::pin(self.ask(request))
    }
}

/// Type-erased decision oracle.
pub struct BoxDecisionOracle {
    inner: Box<dyn DecisionOracleDyn>,
}

impl BoxDecisionOracle {
    pub fn new<T: DecisionOracle + 'static>(oracle: T) -> Self {
        Self {
            inner: Box::new(oracle),
        }
    }

    pub async fn ask(&self, request: OracleRequest) -> Result<OracleAnswer, OracleError> {
        self.inner.ask_boxed(request).await
    }
}

impl std::fmt::Debug for BoxDecisionOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxDecisionOracle").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Outcome of resolving a conditional edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Continue at `destination`.
    Routed { destination: String, defaulted: bool },
    /// No source produced a value and there is no default.
    Waiting { options: Vec<String> },
    /// A value was produced, but it is unmapped and there is no default.
    Unmapped { value: String },
}

/// Distinct destinations of an edge, in table order, including the default.
pub fn destination_options(edge: &ConditionalEdge) -> Vec<String> {
    let mut options: Vec<String> = Vec::new();
    for dest in edge.destinations.values().chain(edge.default.iter()) {
        if !options.contains(dest) {
            options.push(dest.clone());
        }
    }
    options
}

// ---------------------------------------------------------------------------
// DecisionRouter
// ---------------------------------------------------------------------------

/// Resolves conditional edges and keeps the decision log.
pub struct DecisionRouter {
    functions: Arc<FunctionRegistry>,
    oracle: Option<Arc<BoxDecisionOracle>>,
    oracle_timeout: Duration,
    events: EventBus,
    records: DashMap<Uuid, Vec<DecisionRecord>>,
}

impl DecisionRouter {
    pub fn new(
        functions: Arc<FunctionRegistry>,
        oracle: Option<Arc<BoxDecisionOracle>>,
        oracle_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            functions,
            oracle,
            oracle_timeout,
            events,
            records: DashMap::new(),
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Resolve `edge` for `state` and record the decision.
    pub async fn resolve(&self, state: &WorkflowState, edge: &ConditionalEdge) -> Resolution {
        let mut last_source: Option<&CriterionSource> = None;
        let mut value: Option<String> = None;
        for source in &edge.sources {
            last_source = Some(source);
            if let Some(v) = self.evaluate(state, edge, source).await {
                value = Some(v);
                break;
            }
        }

        let (resolution, destination, defaulted) = match &value {
            Some(v) => match edge.destinations.get(v) {
                Some(dest) => (
                    Resolution::Routed {
                        destination: dest.clone(),
                        defaulted: false,
                    },
                    Some(dest.clone()),
                    false,
                ),
                None => match &edge.default {
                    Some(default) => (
                        Resolution::Routed {
                            destination: default.clone(),
                            defaulted: true,
                        },
                        Some(default.clone()),
                        true,
                    ),
                    None => (Resolution::Unmapped { value: v.clone() }, None, false),
                },
            },
            None => match &edge.default {
                Some(default) => (
                    Resolution::Routed {
                        destination: default.clone(),
                        defaulted: true,
                    },
                    Some(default.clone()),
                    true,
                ),
                None => (
                    Resolution::Waiting {
                        options: destination_options(edge),
                    },
                    None,
                    false,
                ),
            },
        };

        let record = DecisionRecord {
            workflow_id: state.workflow_id,
            node: edge.from.clone(),
            criterion_source: last_source.map(CriterionSource::kind),
            criterion: last_source.map(|s| s.criterion().to_string()),
            value,
            destination,
            defaulted,
            timestamp: Utc::now(),
        };
        tracing::debug!(
            workflow_id = %state.workflow_id,
            node = %edge.from,
            value = ?record.value,
            destination = ?record.destination,
            defaulted,
            "conditional edge resolved"
        );
        self.append(record);
        resolution
    }

    /// Record a destination chosen explicitly by a caller.
    pub fn record_manual(&self, workflow_id: Uuid, node: &str, destination: &str) {
        self.append(DecisionRecord {
            workflow_id,
            node: node.to_string(),
            criterion_source: Some(CriterionSourceKind::Manual),
            criterion: None,
            value: Some(destination.to_string()),
            destination: Some(destination.to_string()),
            defaulted: false,
            timestamp: Utc::now(),
        });
    }

    /// Decision records of one workflow, oldest first.
    pub fn records(&self, workflow_id: &Uuid) -> Vec<DecisionRecord> {
        self.records
            .get(workflow_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Drop the decision records of one workflow.
    pub fn forget(&self, workflow_id: &Uuid) {
        self.records.remove(workflow_id);
    }

    fn append(&self, record: DecisionRecord) {
        if record.destination.is_some() {
            let payload = serde_json::to_value(&record).unwrap_or(Value::Null);
            self.events
                .emit(EventType::DecisionMade, record.workflow_id, payload);
        }
        self.records
            .entry(record.workflow_id)
            .or_default()
            .push(record);
    }

    async fn evaluate(
        &self,
        state: &WorkflowState,
        edge: &ConditionalEdge,
        source: &CriterionSource,
    ) -> Option<String> {
        match source {
            CriterionSource::Function { name } => match self.functions.get(name) {
                Some(func) => func.as_ref()(state),
                None => {
                    tracing::warn!(function = %name, "decision function not registered");
                    None
                }
            },
            CriterionSource::Path { path } => {
                lookup_path(&state.context, path).and_then(criterion_key)
            }
            CriterionSource::Delegated {
                question,
                options,
                timeout_secs,
            } => {
                let oracle = self.oracle.as_ref()?;
                let options = if options.is_empty() {
                    edge.destinations.keys().cloned().collect()
                } else {
                    options.clone()
                };
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.oracle_timeout);
                let request = OracleRequest {
                    workflow_id: state.workflow_id,
                    node: edge.from.clone(),
                    question: question.clone(),
                    options: options.clone(),
                    context: state.context.clone(),
                };
                match tokio::time::timeout(timeout, oracle.ask(request)).await {
                    Ok(Ok(OracleAnswer::Choice(choice))) if options.contains(&choice) => {
                        Some(choice)
                    }
                    Ok(Ok(OracleAnswer::Choice(choice))) => {
                        tracing::warn!(
                            workflow_id = %state.workflow_id,
                            node = %edge.from,
                            choice = %choice,
                            "oracle answer outside option set"
                        );
                        None
                    }
                    Ok(Ok(OracleAnswer::NoAnswer)) => None,
                    Ok(Err(e)) => {
                        tracing::warn!(
                            workflow_id = %state.workflow_id,
                            node = %edge.from,
                            error = %e,
                            "oracle failed"
                        );
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            workflow_id = %state.workflow_id,
                            node = %edge.from,
                            timeout_ms = timeout.as_millis() as u64,
                            "oracle timed out"
                        );
                        None
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DecisionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionRouter")
            .field("functions", &self.functions)
            .field("has_oracle", &self.oracle.is_some())
            .field("oracle_timeout", &self.oracle_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pattern detection
// ---------------------------------------------------------------------------

/// Minimum routed decisions before a dominant destination is reported.
pub const DOMINANT_MIN_SAMPLES: usize = 5;

/// Share of routed decisions a destination needs to be dominant.
pub const DOMINANT_RATIO: f64 = 0.8;

/// Summary of the decisions taken at one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionPattern {
    pub node: String,
    pub total: usize,
    pub destinations: BTreeMap<String, usize>,
    pub sources: BTreeMap<CriterionSourceKind, usize>,
    /// Share of routed decisions that fell back to the default.
    pub default_rate: f64,
    pub dominant_destination: Option<String>,
    /// Consecutive routed decisions whose destination changed.
    pub oscillations: usize,
}

/// Summarise decision records per node, sorted by node.
pub fn detect_decision_patterns(records: &[DecisionRecord]) -> Vec<DecisionPattern> {
    let mut by_node: BTreeMap<&str, Vec<&DecisionRecord>> = BTreeMap::new();
    for record in records {
        by_node.entry(record.node.as_str()).or_default().push(record);
    }

    by_node
        .into_iter()
        .map(|(node, records)| {
            let mut destinations = BTreeMap::new();
            let mut sources = BTreeMap::new();
            let mut routed = 0usize;
            let mut defaulted = 0usize;
            let mut oscillations = 0usize;
            let mut previous: Option<&str> = None;

            for record in &records {
                if let Some(source) = record.criterion_source {
                    *sources.entry(source).or_insert(0) += 1;
                }
                let Some(dest) = record.destination.as_deref() else {
                    continue;
                };
                routed += 1;
                if record.defaulted {
                    defaulted += 1;
                }
                *destinations.entry(dest.to_string()).or_insert(0) += 1;
                if previous.is_some_and(|p| p != dest) {
                    oscillations += 1;
                }
                previous = Some(dest);
            }

            let dominant_destination = if routed >= DOMINANT_MIN_SAMPLES {
                destinations
                    .iter()
                    .max_by_key(|(_, count)| **count)
                    .filter(|(_, count)| **count as f64 / routed as f64 >= DOMINANT_RATIO)
                    .map(|(dest, _)| dest.clone())
            } else {
                None
            };

            DecisionPattern {
                node: node.to_string(),
                total: records.len(),
                destinations,
                sources,
                default_rate: if routed == 0 {
                    0.0
                } else {
                    defaulted as f64 / routed as f64
                },
                dominant_destination,
                oscillations,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_types::workflow::END_NODE;

    struct FixedOracle(Result<OracleAnswer, OracleError>);

    impl DecisionOracle for FixedOracle {
        async fn ask(&self, _request: OracleRequest) -> Result<OracleAnswer, OracleError> {
            self.0.clone()
        }
    }

    struct SlowOracle;

    impl DecisionOracle for SlowOracle {
        async fn ask(&self, _request: OracleRequest) -> Result<OracleAnswer, OracleError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(OracleAnswer::Choice("yes".to_string()))
        }
    }

    fn router_with(functions: FunctionRegistry, oracle: Option<BoxDecisionOracle>) -> DecisionRouter {
        DecisionRouter::new(
            Arc::new(functions),
            oracle.map(Arc::new),
            Duration::from_secs(1),
            EventBus::new(16),
        )
    }

    fn router() -> DecisionRouter {
        router_with(FunctionRegistry::new(), None)
    }

    fn state(context: Value) -> WorkflowState {
        let context = match context {
            Value::Object(map) => map,
            _ => ContextMap::new(),
        };
        WorkflowState::new(Uuid::now_v7(), "wf", "c", context)
    }

    fn edge(sources: Vec<CriterionSource>, default: Option<&str>) -> ConditionalEdge {
        ConditionalEdge {
            from: "c".to_string(),
            sources,
            destinations: BTreeMap::from([
                ("yes".to_string(), "d".to_string()),
                ("no".to_string(), "e".to_string()),
            ]),
            default: default.map(String::from),
            values: Vec::new(),
        }
    }

    fn path(p: &str) -> CriterionSource {
        CriterionSource::Path {
            path: p.to_string(),
        }
    }

    fn delegated() -> CriterionSource {
        CriterionSource::Delegated {
            question: "merge?".to_string(),
            options: Vec::new(),
            timeout_secs: None,
        }
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_path_value_maps_to_destination() {
        let router = router();
        let state = state(json!({"verdict": "yes"}));
        let resolution = router.resolve(&state, &edge(vec![path("verdict")], Some("e"))).await;
        assert_eq!(
            resolution,
            Resolution::Routed {
                destination: "d".to_string(),
                defaulted: false
            }
        );
        let records = router.records(&state.workflow_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].criterion_source, Some(CriterionSourceKind::Path));
        assert_eq!(records[0].value.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn test_missing_path_uses_default() {
        let router = router();
        let state = state(json!({}));
        let resolution = router.resolve(&state, &edge(vec![path("verdict")], Some("e"))).await;
        assert_eq!(
            resolution,
            Resolution::Routed {
                destination: "e".to_string(),
                defaulted: true
            }
        );
        let record = &router.records(&state.workflow_id)[0];
        assert_eq!(record.criterion_source, Some(CriterionSourceKind::Path));
        assert_eq!(record.value, None);
        assert_eq!(record.destination.as_deref(), Some("e"));
        assert!(record.defaulted);
    }

    #[tokio::test]
    async fn test_boolean_path_is_stringified() {
        let router = router();
        let mut edge = edge(vec![path("ok")], None);
        edge.destinations = BTreeMap::from([("true".to_string(), END_NODE.to_string())]);
        let resolution = router.resolve(&state(json!({"ok": true})), &edge).await;
        assert_eq!(
            resolution,
            Resolution::Routed {
                destination: END_NODE.to_string(),
                defaulted: false
            }
        );
    }

    #[tokio::test]
    async fn test_sources_tried_in_order() {
        let functions = FunctionRegistry::new()
            .with("undecided", |_state: &WorkflowState| None)
            .with("by_score", |state: &WorkflowState| {
                let score = state.context.get("score")?.as_f64()?;
                Some(if score > 0.5 { "yes" } else { "no" }.to_string())
            });
        let router = router_with(functions, None);
        let edge = edge(
            vec![
                CriterionSource::Function {
                    name: "undecided".to_string(),
                },
                CriterionSource::Function {
                    name: "by_score".to_string(),
                },
                path("verdict"),
            ],
            None,
        );
        let state = state(json!({"score": 0.2, "verdict": "yes"}));
        let resolution = router.resolve(&state, &edge).await;
        assert_eq!(
            resolution,
            Resolution::Routed {
                destination: "e".to_string(),
                defaulted: false
            }
        );
        let record = &router.records(&state.workflow_id)[0];
        assert_eq!(record.criterion_source, Some(CriterionSourceKind::Function));
        assert_eq!(record.criterion.as_deref(), Some("by_score"));
    }

    #[tokio::test]
    async fn test_unmapped_value_without_default() {
        let router = router();
        let state = state(json!({"verdict": "maybe"}));
        let resolution = router.resolve(&state, &edge(vec![path("verdict")], None)).await;
        assert_eq!(
            resolution,
            Resolution::Unmapped {
                value: "maybe".to_string()
            }
        );
        assert_eq!(router.records(&state.workflow_id)[0].destination, None);
    }

    #[tokio::test]
    async fn test_no_value_without_default_waits() {
        let router = router();
        let state = state(json!({}));
        let resolution = router.resolve(&state, &edge(vec![path("verdict")], None)).await;
        assert_eq!(
            resolution,
            Resolution::Waiting {
                options: vec!["e".to_string(), "d".to_string()]
            }
        );
    }

    // -----------------------------------------------------------------------
    // Oracle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_oracle_choice_routes() {
        let oracle = BoxDecisionOracle::new(FixedOracle(Ok(OracleAnswer::Choice("yes".to_string()))));
        let router = router_with(FunctionRegistry::new(), Some(oracle));
        let resolution = router.resolve(&state(json!({})), &edge(vec![delegated()], Some("e"))).await;
        assert_eq!(
            resolution,
            Resolution::Routed {
                destination: "d".to_string(),
                defaulted: false
            }
        );
    }

    #[tokio::test]
    async fn test_oracle_failures_mean_no_value() {
        let answers = [
            Ok(OracleAnswer::NoAnswer),
            Ok(OracleAnswer::Choice("perhaps".to_string())),
            Err(OracleError::Unavailable("offline".to_string())),
        ];
        for answer in answers {
            let router = router_with(FunctionRegistry::new(), Some(BoxDecisionOracle::new(FixedOracle(answer))));
            let resolution = router.resolve(&state(json!({})), &edge(vec![delegated()], Some("e"))).await;
            assert_eq!(
                resolution,
                Resolution::Routed {
                    destination: "e".to_string(),
                    defaulted: true
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_oracle_timeout_means_no_value() {
        let router = router_with(FunctionRegistry::new(), Some(BoxDecisionOracle::new(SlowOracle)));
        let resolution = router.resolve(&state(json!({})), &edge(vec![delegated()], Some("e"))).await;
        assert!(matches!(resolution, Resolution::Routed { defaulted: true, .. }));
    }

    #[tokio::test]
    async fn test_no_oracle_configured_means_no_value() {
        let router = router();
        let state = state(json!({}));
        let resolution = router.resolve(&state, &edge(vec![delegated()], None)).await;
        assert!(matches!(resolution, Resolution::Waiting { .. }));
        let record = &router.records(&state.workflow_id)[0];
        assert_eq!(record.criterion_source, Some(CriterionSourceKind::Delegated));
    }

    // -----------------------------------------------------------------------
    // Events and manual decisions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_routed_decisions_publish_events() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let router = DecisionRouter::new(Arc::new(FunctionRegistry::new()), None, Duration::from_secs(1), events);
        let state = state(json!({"verdict": "no"}));
        router.resolve(&state, &edge(vec![path("verdict")], None)).await;
        router.record_manual(state.workflow_id, "c", "d");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::DecisionMade);
        assert_eq!(first.payload["destination"], json!("e"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["criterion_source"], json!("manual"));
    }

    // -----------------------------------------------------------------------
    // Pattern detection
    // -----------------------------------------------------------------------

    fn record(node: &str, dest: Option<&str>, defaulted: bool) -> DecisionRecord {
        DecisionRecord {
            workflow_id: Uuid::nil(),
            node: node.to_string(),
            criterion_source: Some(CriterionSourceKind::Path),
            criterion: Some("verdict".to_string()),
            value: dest.map(String::from),
            destination: dest.map(String::from),
            defaulted,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_patterns_dominant_destination() {
        let mut records: Vec<DecisionRecord> = (0..4).map(|_| record("c", Some("d"), false)).collect();
        records.push(record("c", Some("e"), true));
        records.push(record("x", Some("y"), false));

        let patterns = detect_decision_patterns(&records);
        assert_eq!(patterns.len(), 2);
        let c = &patterns[0];
        assert_eq!(c.node, "c");
        assert_eq!(c.total, 5);
        assert_eq!(c.destinations["d"], 4);
        assert_eq!(c.dominant_destination.as_deref(), Some("d"));
        assert!((c.default_rate - 0.2).abs() < f64::EPSILON);
        assert_eq!(c.oscillations, 1);
        assert_eq!(patterns[1].dominant_destination, None);
    }

    #[test]
    fn test_patterns_oscillation_and_waiting() {
        let records = vec![
            record("c", Some("d"), false),
            record("c", None, false),
            record("c", Some("e"), false),
            record("c", Some("d"), false),
        ];
        let patterns = detect_decision_patterns(&records);
        assert_eq!(patterns[0].total, 4);
        assert_eq!(patterns[0].oscillations, 2);
        assert_eq!(patterns[0].sources[&CriterionSourceKind::Path], 4);
        assert_eq!(patterns[0].dominant_destination, None);
    }

    #[test]
    fn test_patterns_empty() {
        assert!(detect_decision_patterns(&[]).is_empty());
    }
}
