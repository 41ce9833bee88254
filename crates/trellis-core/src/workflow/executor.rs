//! Workflow graph engine: node-by-node execution with durable checkpointing.
//!
//! The `GraphEngine` walks a compiled workflow graph one node at a time. Each
//! step runs on its own task under a timeout; on success its partial context
//! is merged and the next node is chosen by a static edge or the decision
//! router; on failure the retry controller decides between retrying in place,
//! routing to the node's error handler, or failing the workflow.
//!
//! # Execution flow
//!
//! 1. `create_workflow` compiles the definition and builds a pending state.
//! 2. `execute`/`start` claim the workflow ID (single writer) and checkpoint
//!    the state as `running` at the entry node.
//! 3. Per node: resolve the input template, run the executor, merge, route.
//! 4. Every change of node or status is checkpointed before the next
//!    executor call. Retries in place are not checkpointed.
//! 5. Terminal states (`completed`, `failed`, `cancelled`) get a final
//!    checkpoint and an event; nothing is appended after them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trellis_types::config::EngineConfig;
use trellis_types::event::{EventType, WorkflowEvent};
use trellis_types::workflow::{
    Checkpoint, ContextMap, CriterionSource, DecisionRecord, END_NODE, ErrorInfo, ErrorKind,
    HistoryKind, PendingDecision, StatusSummary, StepDefinition, WorkflowDefinition,
    WorkflowState, WorkflowStatus,
};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::checkpoint::CheckpointStore;

use super::checkpoint::{CheckpointError, CheckpointWriter};
use super::context::{merge_updates, resolve_input, validate_initial_context, validate_updates};
use super::definition::DefinitionError;
use super::graph::{CompiledGraph, Transition, compile};
use super::retry::{ErrorMonitor, ErrorReport, Failure, RecoveryAction, RetryHandler};
use super::router::{
    BoxDecisionOracle, DecisionOracle, DecisionPattern, DecisionRouter, FunctionRegistry,
    Resolution, detect_decision_patterns,
};
use super::step::{ExecutorRegistry, StepInvocation, StepOutput};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// API misuse and restore failures.
///
/// A workflow that fails while running is not an `Err`: `execute` returns
/// `Ok(state)` with `status = failed` and the error on the state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(Uuid),

    #[error("no registered definition '{0}'")]
    UnknownDefinition(String),

    #[error("workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("workflow {id} is terminal ({status:?})")]
    Terminal { id: Uuid, status: WorkflowStatus },

    #[error("workflow {0} is waiting for a decision")]
    AwaitingDecision(Uuid),

    #[error("workflow {0} is not waiting for a decision")]
    NotWaiting(Uuid),

    #[error("invalid decision '{destination}', expected one of {options:?}")]
    InvalidDecision {
        destination: String,
        options: Vec<String>,
    },

    #[error("workflow {0} is sealed")]
    Sealed(Uuid),

    /// The engine's latest state of the workflow never reached the store,
    /// so its checkpoint is stale.
    #[error("workflow {0} is not resumable: its latest state was not persisted")]
    NotResumable(Uuid),

    #[error("restore failed: {0}")]
    Restore(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("task join error: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects the engine's collaborators before construction.
///
/// Registries are frozen by `build` and shared read-only afterwards.
pub struct EngineBuilder<S: CheckpointStore> {
    store: Arc<S>,
    executors: ExecutorRegistry,
    functions: FunctionRegistry,
    oracle: Option<BoxDecisionOracle>,
    events: Option<EventBus>,
    config: EngineConfig,
}

impl<S: CheckpointStore + 'static> EngineBuilder<S> {
    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn oracle<O: DecisionOracle + 'static>(mut self, oracle: O) -> Self {
        self.oracle = Some(BoxDecisionOracle::new(oracle));
        self
    }

    /// Share an existing event bus instead of creating one from the config.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> GraphEngine<S> {
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));
        let writer = CheckpointWriter::new(
            self.store,
            self.config.checkpoint_write_attempts,
            Duration::from_millis(self.config.checkpoint_backoff_ms),
            events.clone(),
        );
        let router = DecisionRouter::new(
            Arc::new(self.functions),
            self.oracle.map(Arc::new),
            Duration::from_secs(self.config.oracle_timeout_secs),
            events.clone(),
        );
        GraphEngine {
            config: self.config,
            writer,
            executors: Arc::new(self.executors),
            router,
            monitor: ErrorMonitor::new(),
            events,
            definitions: DashMap::new(),
            states: DashMap::new(),
            running: Arc::new(DashMap::new()),
            sealed: DashSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// GraphEngine
// ---------------------------------------------------------------------------

/// Tokens of a workflow that is currently being driven.
#[derive(Clone)]
struct RunTokens {
    cancel: CancellationToken,
    /// Cancelled once the run has ended and released its claim.
    stopped: CancellationToken,
}

/// Releases a workflow's claim when its run ends.
struct RunGuard {
    running: Arc<DashMap<Uuid, RunTokens>>,
    id: Uuid,
    stopped: CancellationToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
        self.stopped.cancel();
    }
}

/// Result of one executor attempt.
enum Attempt {
    Success(StepOutput),
    Failure {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    Cancelled,
}

/// Workflow graph engine with durable checkpointing.
///
/// Generic over `S: CheckpointStore` for storage flexibility.
pub struct GraphEngine<S: CheckpointStore> {
    config: EngineConfig,
    writer: CheckpointWriter<S>,
    executors: Arc<ExecutorRegistry>,
    router: DecisionRouter,
    monitor: ErrorMonitor,
    events: EventBus,
    /// Compiled definitions keyed by definition ID.
    definitions: DashMap<String, Arc<CompiledGraph>>,
    /// Latest in-memory state per workflow.
    states: DashMap<Uuid, WorkflowState>,
    /// Workflows currently being driven.
    running: Arc<DashMap<Uuid, RunTokens>>,
    sealed: DashSet<Uuid>,
}

impl<S: CheckpointStore + 'static> GraphEngine<S> {
    pub fn builder(store: Arc<S>) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            executors: ExecutorRegistry::new(),
            functions: FunctionRegistry::new(),
            oracle: None,
            events: None,
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<S> {
        self.writer.store()
    }

    // -----------------------------------------------------------------------
    // Definitions and creation
    // -----------------------------------------------------------------------

    /// Compile a definition, check it against the registries and make it
    /// available for creation and resume.
    pub fn register_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<CompiledGraph>, DefinitionError> {
        let graph = compile(definition)?;

        for step in &definition.steps {
            if !self.executors.contains(&step.kind) {
                return Err(DefinitionError::UnknownStepKind {
                    step: step.id.clone(),
                    kind: step.kind.clone(),
                });
            }
        }
        for edge in &definition.conditional_edges {
            for source in &edge.sources {
                if let CriterionSource::Function { name } = source {
                    if !self.router.functions().contains(name) {
                        return Err(DefinitionError::UnknownFunction {
                            node: edge.from.clone(),
                            name: name.clone(),
                        });
                    }
                }
            }
        }

        let graph = Arc::new(graph);
        self.definitions
            .insert(definition.id.clone(), Arc::clone(&graph));
        tracing::debug!(definition_id = %definition.id, "workflow definition registered");
        Ok(graph)
    }

    /// Instantiate a workflow. Nothing executes until `execute` or `start`.
    pub fn create_workflow(
        &self,
        definition: &WorkflowDefinition,
        initial_context: ContextMap,
    ) -> Result<Uuid, DefinitionError> {
        let graph = self.register_definition(definition)?;
        validate_initial_context(definition.context_schema.as_ref(), &initial_context)
            .map_err(DefinitionError::Schema)?;

        let id = Uuid::now_v7();
        let state = WorkflowState::new(id, &definition.id, graph.entry(), initial_context);
        self.states.insert(id, state);
        tracing::info!(workflow_id = %id, definition_id = %definition.id, "workflow created");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    fn claim(&self, id: Uuid) -> Result<(RunGuard, CancellationToken), EngineError> {
        if self.sealed.contains(&id) {
            return Err(EngineError::Sealed(id));
        }
        match self.running.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyRunning(id)),
            Entry::Vacant(slot) => {
                let tokens = RunTokens {
                    cancel: CancellationToken::new(),
                    stopped: CancellationToken::new(),
                };
                slot.insert(tokens.clone());
                Ok((
                    RunGuard {
                        running: Arc::clone(&self.running),
                        id,
                        stopped: tokens.stopped,
                    },
                    tokens.cancel,
                ))
            }
        }
    }

    fn graph_for(&self, state: &WorkflowState) -> Result<Arc<CompiledGraph>, EngineError> {
        self.definitions
            .get(&state.definition_id)
            .map(|g| Arc::clone(g.value()))
            .ok_or_else(|| EngineError::UnknownDefinition(state.definition_id.clone()))
    }

    fn snapshot(&self, id: &Uuid) -> Result<WorkflowState, EngineError> {
        self.states
            .get(id)
            .map(|s| s.clone())
            .ok_or(EngineError::UnknownWorkflow(*id))
    }

    /// Claim and validate a workflow for driving.
    fn prepare(
        &self,
        id: Uuid,
    ) -> Result<(RunGuard, CancellationToken, Arc<CompiledGraph>, WorkflowState), EngineError> {
        if self.sealed.contains(&id) {
            return Err(EngineError::Sealed(id));
        }
        let state = self.snapshot(&id)?;
        if state.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: state.status,
            });
        }
        if state.status == WorkflowStatus::WaitingDecision {
            return Err(EngineError::AwaitingDecision(id));
        }
        let graph = self.graph_for(&state)?;
        let (guard, token) = self.claim(id)?;
        Ok((guard, token, graph, state))
    }

    /// Run a workflow to a terminal or waiting state and return it.
    pub async fn execute(&self, id: Uuid) -> Result<WorkflowState, EngineError> {
        let (_guard, token, graph, state) = self.prepare(id)?;
        Ok(self.drive(graph, state, token).await)
    }

    /// Run a workflow on its own task. Returns as soon as it is spawned.
    pub fn start(
        self: &Arc<Self>,
        id: Uuid,
    ) -> Result<JoinHandle<Result<WorkflowState, EngineError>>, EngineError> {
        let (guard, token, graph, state) = self.prepare(id)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            Ok(engine.drive(graph, state, token).await)
        }))
    }

    /// Restore a workflow from its latest checkpoint and continue it.
    ///
    /// The definition is looked up by the checkpoint's `definition_id`, so it
    /// must have been registered first. A workflow restored while waiting for
    /// a decision is returned as-is.
    ///
    /// When this engine still holds the workflow, that state wins over the
    /// store: a terminal one is refused, and so is one whose latest
    /// checkpoint write failed.
    pub async fn resume_workflow(&self, id: Uuid) -> Result<WorkflowState, EngineError> {
        if self.sealed.contains(&id) {
            return Err(EngineError::Sealed(id));
        }
        if self.running.contains_key(&id) {
            return Err(EngineError::AlreadyRunning(id));
        }
        if let Some(current) = self.state(&id) {
            if current.status.is_terminal() {
                return Err(EngineError::Terminal {
                    id,
                    status: current.status,
                });
            }
            if current.persistence_degraded {
                return Err(EngineError::NotResumable(id));
            }
        }
        let checkpoint = self.writer.restore(&id).await.map_err(|e| match e {
            CheckpointError::NotFound(_) => EngineError::UnknownWorkflow(id),
            other => EngineError::Restore(other.to_string()),
        })?;
        let state = checkpoint.state;
        if state.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: state.status,
            });
        }
        let graph = self.graph_for(&state)?;
        if !graph.contains(&state.current_node) {
            return Err(EngineError::Restore(format!(
                "checkpoint node '{}' is not part of definition '{}'",
                state.current_node, state.definition_id
            )));
        }

        tracing::info!(
            workflow_id = %id,
            seq = checkpoint.sequence_number,
            node = %state.current_node,
            "restoring workflow from checkpoint"
        );
        let waiting = state.status == WorkflowStatus::WaitingDecision;
        self.states.insert(id, state.clone());
        if waiting {
            return Ok(state);
        }
        self.execute(id).await
    }

    /// Cancel a workflow.
    ///
    /// A running workflow stops at its next suspension point; a pending or
    /// waiting one is cancelled directly. Either way a final checkpoint is
    /// written.
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        if let Some(run) = self.running.get(&id) {
            run.cancel.cancel();
            tracing::info!(workflow_id = %id, "cancellation requested");
            return Ok(());
        }

        let mut state = match self.states.get(&id).map(|s| s.clone()) {
            Some(state) => state,
            None => {
                let checkpoint = self.writer.restore(&id).await.map_err(|e| match e {
                    CheckpointError::NotFound(_) => EngineError::UnknownWorkflow(id),
                    other => EngineError::Restore(other.to_string()),
                })?;
                checkpoint.state
            }
        };
        if state.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: state.status,
            });
        }

        let _guard = match self.claim(id) {
            Ok((guard, _)) => guard,
            Err(EngineError::AlreadyRunning(_)) => {
                if let Some(run) = self.running.get(&id) {
                    run.cancel.cancel();
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.finish_cancelled(&mut state).await;
        Ok(())
    }

    /// Cancel a workflow and wait until its run, if any, has stopped and
    /// written its final checkpoint.
    pub async fn cancel_and_wait(&self, id: Uuid) -> Result<(), EngineError> {
        let stopped = self.running.get(&id).map(|run| run.stopped.clone());
        self.cancel(id).await?;
        if let Some(stopped) = stopped {
            stopped.cancelled().await;
        }
        Ok(())
    }

    /// Choose the destination of a workflow waiting for a decision and
    /// continue executing it.
    pub async fn submit_decision(
        &self,
        id: Uuid,
        destination: &str,
    ) -> Result<WorkflowState, EngineError> {
        if self.sealed.contains(&id) {
            return Err(EngineError::Sealed(id));
        }
        let mut state = self.snapshot(&id)?;
        let Some(pending) = state.pending_decision.clone() else {
            return Err(EngineError::NotWaiting(id));
        };
        if state.status != WorkflowStatus::WaitingDecision {
            return Err(EngineError::NotWaiting(id));
        }
        let graph = self.graph_for(&state)?;
        let resolved = graph
            .resolve_destination(destination)
            .filter(|d| pending.options.contains(d))
            .ok_or_else(|| EngineError::InvalidDecision {
                destination: destination.to_string(),
                options: pending.options.clone(),
            })?;

        let (_guard, token) = self.claim(id)?;
        self.router.record_manual(id, &pending.node, &resolved);
        state.pending_decision = None;
        state.status = WorkflowStatus::Running;
        state.push_history(
            &pending.node,
            HistoryKind::Decision,
            json!({"destination": resolved, "source": "manual"}),
        );
        tracing::info!(workflow_id = %id, node = %pending.node, destination = %resolved, "decision submitted");

        if resolved == END_NODE {
            return Ok(self.finish_completed(state).await);
        }
        state.current_node = resolved;
        state.touch();
        self.persist(&mut state).await;
        Ok(self.run_loop(graph, state, token).await)
    }

    /// Refuse any further runs of a workflow (used when its session ends).
    ///
    /// A workflow that is not running is also given a terminal checkpoint
    /// if its latest one is not terminal yet, so the store refuses further
    /// appends after a restart. A non-terminal state is recorded as
    /// `cancelled`. A running workflow writes its own final checkpoint.
    pub async fn seal(&self, id: Uuid) -> Result<(), EngineError> {
        self.sealed.insert(id);
        if self.running.contains_key(&id) {
            return Ok(());
        }

        let latest = match self.writer.restore(&id).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(CheckpointError::NotFound(_)) => None,
            Err(e) => return Err(EngineError::Restore(e.to_string())),
        };
        if latest.as_ref().is_some_and(|c| c.status().is_terminal()) {
            return Ok(());
        }
        let mut state = match (self.state(&id), latest) {
            (Some(state), _) => state,
            (None, Some(checkpoint)) => checkpoint.state,
            (None, None) => return Ok(()),
        };
        if !state.status.is_terminal() {
            state.status = WorkflowStatus::Cancelled;
            state.pending_decision = None;
            state.touch();
        }

        match self.writer.write(&mut state).await {
            Ok(_) | Err(CheckpointError::Conflict(_)) => {}
            Err(e) => {
                self.record_state(&state);
                return Err(e.into());
            }
        }
        self.record_state(&state);
        tracing::info!(workflow_id = %id, status = ?state.status, "workflow sealed");
        Ok(())
    }

    /// Drop everything this engine holds for a terminal workflow: its state,
    /// seal, decision and error records. Its last checkpoint stays the
    /// durable record, and `status` falls back to it.
    ///
    /// Returns `false` (and keeps everything) for workflows that are not
    /// terminal, still running, or whose final state was never persisted.
    pub fn forget(&self, id: &Uuid) -> bool {
        if self.running.contains_key(id) {
            return false;
        }
        let removed = self
            .states
            .remove_if(id, |_, s| s.status.is_terminal() && !s.persistence_degraded)
            .is_some();
        if removed {
            self.sealed.remove(id);
            self.router.forget(id);
            self.monitor.forget(id);
            tracing::debug!(workflow_id = %id, "terminal workflow evicted");
        }
        removed
    }

    /// [`forget`](Self::forget) every terminal workflow. Returns how many
    /// were evicted.
    pub fn evict_terminal(&self) -> usize {
        let terminal: Vec<Uuid> = self
            .states
            .iter()
            .filter(|s| s.status.is_terminal())
            .map(|s| *s.key())
            .collect();
        terminal.iter().filter(|id| self.forget(id)).count()
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.running.contains_key(id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Status from memory, falling back to the latest checkpoint.
    pub async fn status(&self, id: Uuid) -> Result<StatusSummary, EngineError> {
        if let Some(state) = self.states.get(&id) {
            return Ok(state.summary());
        }
        match self.writer.restore(&id).await {
            Ok(checkpoint) => Ok(checkpoint.state.summary()),
            Err(CheckpointError::NotFound(_)) => Err(EngineError::UnknownWorkflow(id)),
            Err(e) => Err(EngineError::Checkpoint(e)),
        }
    }

    /// Latest in-memory state, if the workflow is known to this engine.
    pub fn state(&self, id: &Uuid) -> Option<WorkflowState> {
        self.states.get(id).map(|s| s.clone())
    }

    pub async fn checkpoints(&self, id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.writer.history(id).await?)
    }

    pub fn error_report(&self, id: &Uuid) -> ErrorReport {
        self.monitor.report(id)
    }

    pub fn decision_records(&self, id: &Uuid) -> Vec<DecisionRecord> {
        self.router.records(id)
    }

    pub fn decision_patterns(&self, id: &Uuid) -> Vec<DecisionPattern> {
        detect_decision_patterns(&self.router.records(id))
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        graph: Arc<CompiledGraph>,
        mut state: WorkflowState,
        token: CancellationToken,
    ) -> WorkflowState {
        let resumed = state.status != WorkflowStatus::Pending;
        if !resumed {
            state.status = WorkflowStatus::Running;
            state.touch();
            self.persist(&mut state).await;
        } else {
            self.record_state(&state);
        }
        self.events.emit(
            EventType::Started,
            state.workflow_id,
            json!({
                "definition_id": state.definition_id,
                "node": state.current_node,
                "resumed": resumed,
            }),
        );
        tracing::info!(
            workflow_id = %state.workflow_id,
            node = %state.current_node,
            resumed,
            "starting workflow execution"
        );
        self.run_loop(graph, state, token).await
    }

    async fn run_loop(
        &self,
        graph: Arc<CompiledGraph>,
        mut state: WorkflowState,
        token: CancellationToken,
    ) -> WorkflowState {
        loop {
            if token.is_cancelled() {
                return self.finish_cancelled(&mut state).await;
            }

            let node = state.current_node.clone();
            if node == END_NODE {
                return self.finish_completed(state).await;
            }
            let Some(step) = graph.step(&node) else {
                let info = ErrorInfo {
                    kind: ErrorKind::Definition,
                    message: format!("node '{node}' is not part of the workflow"),
                    node: node.clone(),
                    cause: None,
                };
                return self.finish_failed(state, info).await;
            };

            if state.transitions >= self.config.max_transitions {
                let message = format!(
                    "transition limit of {} reached",
                    self.config.max_transitions
                );
                self.monitor.record(
                    state.workflow_id,
                    &node,
                    ErrorKind::TransitionLimitExceeded,
                    &message,
                    state.retry_count(&node) + 1,
                );
                let info = ErrorInfo {
                    kind: ErrorKind::TransitionLimitExceeded,
                    message,
                    node: node.clone(),
                    cause: None,
                };
                return self.finish_failed(state, info).await;
            }
            state.transitions += 1;

            let attempt = state.retry_count(&node) + 1;
            tracing::debug!(workflow_id = %state.workflow_id, node = %node, attempt, "running step");

            let outcome = self.attempt(&state, step, attempt, &token).await;
            let failure = match outcome {
                Attempt::Cancelled => return self.finish_cancelled(&mut state).await,
                Attempt::Failure {
                    kind,
                    message,
                    retryable,
                } => Some((kind, message, retryable)),
                Attempt::Success(output) => {
                    match self.apply_output(&graph, &mut state, &node, attempt, output) {
                        Ok(()) => None,
                        Err(message) => Some((ErrorKind::StepExecution, message, true)),
                    }
                }
            };

            let next = match failure {
                Some((kind, message, retryable)) => {
                    let recovery = self
                        .recover(&graph, &mut state, step, kind, message, retryable, &token)
                        .await;
                    match recovery {
                        Recovery::Continue => continue,
                        Recovery::Goto(next) => next,
                        Recovery::Done => return state,
                    }
                }
                None => match graph.transition(&node) {
                    Some(Transition::Static(to)) => to.clone(),
                    Some(Transition::End) | None => END_NODE.to_string(),
                    Some(Transition::Conditional(edge)) => {
                        let resolution = self.router.resolve(&state, edge).await;
                        match resolution {
                            Resolution::Routed {
                                destination,
                                defaulted,
                            } => {
                                state.push_history(
                                    &node,
                                    HistoryKind::Decision,
                                    json!({"destination": destination, "defaulted": defaulted}),
                                );
                                destination
                            }
                            Resolution::Waiting { options } => {
                                return self.wait_for_decision(state, &node, options).await;
                            }
                            Resolution::Unmapped { value } => {
                                let message = format!(
                                    "criterion value '{value}' at node '{node}' has no destination and no default"
                                );
                                let recovery = self
                                    .recover(
                                        &graph,
                                        &mut state,
                                        step,
                                        ErrorKind::Routing,
                                        message,
                                        false,
                                        &token,
                                    )
                                    .await;
                                match recovery {
                                    Recovery::Continue => continue,
                                    Recovery::Goto(next) => next,
                                    Recovery::Done => return state,
                                }
                            }
                        }
                    }
                },
            };

            if next == END_NODE {
                return self.finish_completed(state).await;
            }
            state.current_node = next;
            state.touch();
            self.persist(&mut state).await;
        }
    }

    /// Run one executor attempt on its own task.
    async fn attempt(
        &self,
        state: &WorkflowState,
        step: &StepDefinition,
        attempt: u32,
        token: &CancellationToken,
    ) -> Attempt {
        let Some(executor) = self.executors.get(&step.kind) else {
            return Attempt::Failure {
                kind: ErrorKind::Definition,
                message: format!("no executor registered for kind '{}'", step.kind),
                retryable: false,
            };
        };

        let invocation = StepInvocation {
            workflow_id: state.workflow_id,
            step: step.clone(),
            input: resolve_input(&step.input, state),
            context: state.context.clone(),
            history: state.history.clone(),
            attempt,
            cancel: token.child_token(),
        };
        let timeout = Duration::from_secs(
            step.timeout_secs
                .unwrap_or(self.config.default_step_timeout_secs),
        );

        let mut handle = tokio::spawn(async move { executor.execute(invocation).await });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                // The executor task is detached, not aborted; its result is dropped.
                Attempt::Cancelled
            }
            joined = tokio::time::timeout(timeout, &mut handle) => match joined {
                Ok(Ok(Ok(output))) => Attempt::Success(output),
                Ok(Ok(Err(e))) => Attempt::Failure {
                    kind: ErrorKind::StepExecution,
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                },
                Ok(Err(join_err)) => Attempt::Failure {
                    kind: ErrorKind::StepExecution,
                    message: format!("step '{}' panicked: {join_err}", step.id),
                    retryable: true,
                },
                Err(_elapsed) => {
                    handle.abort();
                    Attempt::Failure {
                        kind: ErrorKind::StepTimeout,
                        message: format!(
                            "step '{}' timed out after {}s",
                            step.id,
                            timeout.as_secs()
                        ),
                        retryable: true,
                    }
                }
            }
        }
    }

    /// Validate and merge a successful step's output.
    fn apply_output(
        &self,
        graph: &CompiledGraph,
        state: &mut WorkflowState,
        node: &str,
        attempt: u32,
        output: StepOutput,
    ) -> Result<(), String> {
        let schema = graph.definition().context_schema.as_ref();
        validate_updates(schema, &output.updates).map_err(|e| e.to_string())?;
        let content = Value::Object(output.updates.clone());
        merge_updates(&mut state.context, output.updates).map_err(|e| e.to_string())?;

        state.push_history(node, HistoryKind::Step, content);
        state.reset_retry(node);
        // A node that recovered from its own retried failure clears it;
        // errors routed to a handler stay on the state.
        if state.error.as_ref().is_some_and(|e| e.node == node) {
            state.error = None;
        }
        state.touch();
        self.events.emit(
            EventType::StepCompleted,
            state.workflow_id,
            json!({"node": node, "attempt": attempt}),
        );
        tracing::debug!(workflow_id = %state.workflow_id, node, attempt, "step completed");
        Ok(())
    }

    /// Apply the retry controller's decision to a failed attempt.
    #[allow(clippy::too_many_arguments)]
    async fn recover(
        &self,
        graph: &CompiledGraph,
        state: &mut WorkflowState,
        step: &StepDefinition,
        kind: ErrorKind,
        message: String,
        retryable: bool,
        token: &CancellationToken,
    ) -> Recovery {
        let node = step.id.clone();
        let failures = state.increment_retry(&node);
        self.monitor
            .record(state.workflow_id, &node, kind, &message, failures);

        let definition = graph.definition();
        let max_retries = step
            .max_retries
            .or(definition.retry.as_ref().map(|r| r.max_retries))
            .unwrap_or(self.config.default_max_retries);
        let backoff = definition
            .retry
            .as_ref()
            .map(|r| &r.backoff)
            .unwrap_or(&self.config.backoff);

        let action = RetryHandler::decide(
            Failure {
                kind,
                retryable,
                failures,
            },
            max_retries,
            backoff,
            graph.handler(&node),
        );

        match action {
            RecoveryAction::Retry { delay } => {
                state.error = Some(ErrorInfo {
                    kind,
                    message: message.clone(),
                    node: node.clone(),
                    cause: None,
                });
                state.touch();
                self.record_state(state);
                self.events.emit(
                    EventType::StepRetrying,
                    state.workflow_id,
                    json!({
                        "node": node,
                        "attempt": failures,
                        "next_attempt": failures + 1,
                        "max_retries": max_retries,
                        "delay_ms": delay.as_millis() as u64,
                        "kind": kind,
                        "message": message,
                    }),
                );
                tracing::warn!(
                    workflow_id = %state.workflow_id,
                    node = %node,
                    attempt = failures,
                    max_retries,
                    error = %message,
                    "step failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                Recovery::Continue
            }
            RecoveryAction::RouteToHandler {
                handler,
                kind,
                cause,
            } => {
                tracing::warn!(
                    workflow_id = %state.workflow_id,
                    node = %node,
                    handler = %handler,
                    kind = %kind,
                    "routing failed node to error handler"
                );
                state.error = Some(ErrorInfo {
                    kind,
                    message,
                    node: node.clone(),
                    cause,
                });
                state.reset_retry(&node);
                state.push_history(
                    &node,
                    HistoryKind::ErrorHandled,
                    json!({"handler": handler, "kind": kind, "cause": cause}),
                );
                Recovery::Goto(handler)
            }
            RecoveryAction::Fail { kind, cause } => {
                let info = ErrorInfo {
                    kind,
                    message,
                    node,
                    cause,
                };
                let finished = self.finish_failed(state.clone(), info).await;
                *state = finished;
                Recovery::Done
            }
        }
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn record_state(&self, state: &WorkflowState) {
        self.states.insert(state.workflow_id, state.clone());
    }

    /// Checkpoint and publish the in-memory snapshot. Persistence failures
    /// only degrade the workflow.
    async fn persist(&self, state: &mut WorkflowState) {
        match self.writer.write(state).await {
            Ok(_) | Err(CheckpointError::Degraded { .. }) => {}
            Err(e) => {
                tracing::warn!(workflow_id = %state.workflow_id, error = %e, "checkpoint rejected");
            }
        }
        self.record_state(state);
    }

    async fn wait_for_decision(
        &self,
        mut state: WorkflowState,
        node: &str,
        options: Vec<String>,
    ) -> WorkflowState {
        state.status = WorkflowStatus::WaitingDecision;
        state.pending_decision = Some(PendingDecision {
            node: node.to_string(),
            options: options.clone(),
        });
        state.touch();
        self.persist(&mut state).await;
        self.events.emit(
            EventType::DecisionWaiting,
            state.workflow_id,
            json!({"node": node, "options": options}),
        );
        tracing::info!(workflow_id = %state.workflow_id, node, "waiting for decision");
        state
    }

    async fn finish_completed(&self, mut state: WorkflowState) -> WorkflowState {
        state.status = WorkflowStatus::Completed;
        state.touch();
        self.persist(&mut state).await;
        self.events.emit(
            EventType::Completed,
            state.workflow_id,
            json!({"node": state.current_node, "transitions": state.transitions}),
        );
        tracing::info!(
            workflow_id = %state.workflow_id,
            transitions = state.transitions,
            "workflow completed"
        );
        state
    }

    async fn finish_failed(&self, mut state: WorkflowState, info: ErrorInfo) -> WorkflowState {
        state.status = WorkflowStatus::Failed;
        state.error = Some(info.clone());
        state.touch();
        self.persist(&mut state).await;
        self.events.emit(
            EventType::Failed,
            state.workflow_id,
            json!({"node": info.node, "error": info}),
        );
        tracing::info!(
            workflow_id = %state.workflow_id,
            node = %info.node,
            kind = %info.kind,
            error = %info.message,
            "workflow failed"
        );
        state
    }

    async fn finish_cancelled(&self, state: &mut WorkflowState) -> WorkflowState {
        state.status = WorkflowStatus::Cancelled;
        state.pending_decision = None;
        state.touch();
        self.persist(state).await;
        self.events.emit(
            EventType::Cancelled,
            state.workflow_id,
            json!({"node": state.current_node}),
        );
        tracing::info!(workflow_id = %state.workflow_id, node = %state.current_node, "workflow cancelled");
        state.clone()
    }
}

/// How the loop continues after a failed attempt.
enum Recovery {
    /// Retry the same node.
    Continue,
    /// Continue at another node (the error handler).
    Goto(String),
    /// The workflow reached a terminal state.
    Done,
}

impl<S: CheckpointStore> std::fmt::Debug for GraphEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEngine")
            .field("definitions", &self.definitions.len())
            .field("workflows", &self.states.len())
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
