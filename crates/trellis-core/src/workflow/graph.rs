//! Workflow graph compiler.
//!
//! Turns a `WorkflowDefinition` into a `CompiledGraph`: every node has at
//! most one outgoing transition, branch names and handlers are resolved to
//! node IDs, and the graph has been checked for dangling references,
//! ambiguous edges, unmapped criteria, static cycles and unreachable nodes.
//! Uses `petgraph` for the cycle and reachability analysis.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use trellis_types::workflow::{
    ConditionalEdge, CriterionSource, END_NODE, StepDefinition, WorkflowDefinition,
};

use super::definition::{DefinitionError, validate_definition};

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

/// Outgoing transition of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Follow the static edge to this node (or `__end__`).
    Static(String),
    /// Resolve the next node through the decision router. Destinations and
    /// default are already resolved to node IDs.
    Conditional(ConditionalEdge),
    /// No outgoing edge: the workflow completes after this node.
    End,
}

/// A validated, immutable workflow graph.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    definition: Arc<WorkflowDefinition>,
    entry: String,
    step_index: HashMap<String, usize>,
    transitions: HashMap<String, Transition>,
    handlers: HashMap<String, String>,
}

impl CompiledGraph {
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn definition_arc(&self) -> Arc<WorkflowDefinition> {
        Arc::clone(&self.definition)
    }

    /// Entry node ID (branch names already resolved).
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn step(&self, node: &str) -> Option<&StepDefinition> {
        self.step_index
            .get(node)
            .map(|&idx| &self.definition.steps[idx])
    }

    pub fn contains(&self, node: &str) -> bool {
        self.step_index.contains_key(node)
    }

    /// Outgoing transition of `node`. `None` for unknown nodes.
    pub fn transition(&self, node: &str) -> Option<&Transition> {
        self.transitions.get(node)
    }

    /// Error-handler node for `node`, if one is declared.
    pub fn handler(&self, node: &str) -> Option<&str> {
        self.handlers.get(node).map(String::as_str)
    }

    /// Resolve a destination name (node ID, branch name or `__end__`).
    pub fn resolve_destination(&self, name: &str) -> Option<String> {
        resolve_name(&self.definition, name)
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

fn resolve_name(def: &WorkflowDefinition, name: &str) -> Option<String> {
    if name == END_NODE || def.steps.iter().any(|s| s.id == name) {
        return Some(name.to_string());
    }
    def.branches
        .get(name)
        .and_then(|members| members.first().cloned())
}

fn resolve_or_err(
    def: &WorkflowDefinition,
    name: &str,
    context: impl FnOnce() -> String,
) -> Result<String, DefinitionError> {
    resolve_name(def, name).ok_or_else(|| DefinitionError::UnknownNode {
        context: context(),
        target: name.to_string(),
    })
}

/// Compile and validate a workflow definition.
///
/// Runs `validate_definition` first, then checks, in order: entry,
/// branch members, edge sources and destinations, error handlers,
/// ambiguity, conditional criteria, static cycles, reachability and
/// criterion paths against the context schema.
pub fn compile(def: &WorkflowDefinition) -> Result<CompiledGraph, DefinitionError> {
    validate_definition(def)?;

    let step_index: HashMap<String, usize> = def
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let entry = resolve_name(def, &def.entry)
        .filter(|e| e != END_NODE)
        .ok_or_else(|| DefinitionError::MissingEntry(def.entry.clone()))?;

    // Branch members must be real nodes.
    for (name, members) in &def.branches {
        for member in members {
            if !step_index.contains_key(member) {
                return Err(DefinitionError::UnknownNode {
                    context: format!("branch '{name}'"),
                    target: member.clone(),
                });
            }
        }
    }

    // Static edges: explicit edges plus branch chains, deduplicated.
    let mut static_edges: Vec<(String, String)> = Vec::new();
    for edge in &def.edges {
        if !step_index.contains_key(&edge.from) {
            return Err(DefinitionError::UnknownNode {
                context: "static edge source".to_string(),
                target: edge.from.clone(),
            });
        }
        let to = resolve_or_err(def, &edge.to, || format!("static edge from '{}'", edge.from))?;
        static_edges.push((edge.from.clone(), to));
    }
    for members in def.branches.values() {
        for pair in members.windows(2) {
            static_edges.push((pair[0].clone(), pair[1].clone()));
        }
    }
    let mut seen = HashSet::new();
    static_edges.retain(|edge| seen.insert(edge.clone()));

    // Conditional edges with destinations resolved to node IDs.
    let mut conditional_edges: Vec<ConditionalEdge> = Vec::new();
    for edge in &def.conditional_edges {
        if !step_index.contains_key(&edge.from) {
            return Err(DefinitionError::UnknownNode {
                context: "conditional edge source".to_string(),
                target: edge.from.clone(),
            });
        }
        let mut resolved = edge.clone();
        for (value, dest) in resolved.destinations.iter_mut() {
            *dest = resolve_or_err(def, dest, || {
                format!("conditional edge from '{}' (value '{value}')", edge.from)
            })?;
        }
        if let Some(default) = resolved.default.as_mut() {
            *default = resolve_or_err(def, default, || {
                format!("default of conditional edge from '{}'", edge.from)
            })?;
        }
        conditional_edges.push(resolved);
    }

    let mut handlers = HashMap::new();
    for (node, handler) in &def.error_handlers {
        if !step_index.contains_key(node) {
            return Err(DefinitionError::UnknownNode {
                context: "error handler source".to_string(),
                target: node.clone(),
            });
        }
        let resolved = resolve_or_err(def, handler, || format!("error handler of '{node}'"))?;
        handlers.insert(node.clone(), resolved);
    }

    // At most one outgoing transition per node.
    let mut transitions: HashMap<String, Transition> = HashMap::new();
    for (from, to) in &static_edges {
        if transitions
            .insert(from.clone(), Transition::Static(to.clone()))
            .is_some()
        {
            return Err(DefinitionError::Ambiguous(from.clone()));
        }
    }
    for edge in &conditional_edges {
        if transitions
            .insert(edge.from.clone(), Transition::Conditional(edge.clone()))
            .is_some()
        {
            return Err(DefinitionError::Ambiguous(edge.from.clone()));
        }
    }

    for edge in &conditional_edges {
        check_criteria(edge)?;
    }

    check_static_cycles(def, &static_edges)?;
    check_reachability(def, &entry, &transitions, &handlers)?;
    check_schema_paths(def, &conditional_edges)?;

    for step in &def.steps {
        transitions
            .entry(step.id.clone())
            .or_insert(Transition::End);
    }

    Ok(CompiledGraph {
        definition: Arc::new(def.clone()),
        entry,
        step_index,
        transitions,
        handlers,
    })
}

fn check_criteria(edge: &ConditionalEdge) -> Result<(), DefinitionError> {
    if edge.sources.is_empty() && edge.default.is_none() {
        return Err(DefinitionError::Validation(format!(
            "conditional edge from '{}' declares neither a criterion source nor a default",
            edge.from
        )));
    }
    if edge.default.is_some() {
        return Ok(());
    }

    let mut possible: BTreeSet<&str> = edge.values.iter().map(String::as_str).collect();
    for source in &edge.sources {
        if let CriterionSource::Delegated { options, .. } = source {
            possible.extend(options.iter().map(String::as_str));
        }
    }
    let unmapped: Vec<String> = possible
        .into_iter()
        .filter(|v| !edge.destinations.contains_key(*v))
        .map(String::from)
        .collect();
    if !unmapped.is_empty() {
        return Err(DefinitionError::UnmappedCriterion {
            node: edge.from.clone(),
            values: unmapped,
        });
    }
    Ok(())
}

/// Build a petgraph over step IDs. `__end__` targets are skipped.
fn build_graph<'a>(
    def: &'a WorkflowDefinition,
    edges: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> (DiGraph<&'a str, ()>, HashMap<&'a str, NodeIndex>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, NodeIndex> = def
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();
    for (from, to) in edges {
        if let (Some(&a), Some(&b)) = (indices.get(from), indices.get(to)) {
            graph.add_edge(a, b, ());
        }
    }
    (graph, indices)
}

fn check_static_cycles(
    def: &WorkflowDefinition,
    static_edges: &[(String, String)],
) -> Result<(), DefinitionError> {
    let (graph, _) = build_graph(
        def,
        static_edges.iter().map(|(a, b)| (a.as_str(), b.as_str())),
    );
    toposort(&graph, None).map_err(|cycle| {
        DefinitionError::StaticCycle(graph[cycle.node_id()].to_string())
    })?;
    Ok(())
}

fn check_reachability(
    def: &WorkflowDefinition,
    entry: &str,
    transitions: &HashMap<String, Transition>,
    handlers: &HashMap<String, String>,
) -> Result<(), DefinitionError> {
    let mut edges: Vec<(&str, &str)> = Vec::new();
    for (from, transition) in transitions {
        match transition {
            Transition::Static(to) => edges.push((from.as_str(), to.as_str())),
            Transition::Conditional(edge) => {
                edges.extend(edge.destinations.values().map(|to| (from.as_str(), to.as_str())));
                if let Some(default) = &edge.default {
                    edges.push((from.as_str(), default.as_str()));
                }
            }
            Transition::End => {}
        }
    }
    edges.extend(handlers.iter().map(|(a, b)| (a.as_str(), b.as_str())));

    let (graph, indices) = build_graph(def, edges);
    let mut reached = HashSet::new();
    if let Some(&start) = indices.get(entry) {
        let mut dfs = Dfs::new(&graph, start);
        while let Some(idx) = dfs.next(&graph) {
            reached.insert(graph[idx]);
        }
    }

    let unreachable: Vec<String> = def
        .steps
        .iter()
        .filter(|s| !reached.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect();
    if !unreachable.is_empty() {
        return Err(DefinitionError::Unreachable(unreachable));
    }
    Ok(())
}

fn check_schema_paths(
    def: &WorkflowDefinition,
    edges: &[ConditionalEdge],
) -> Result<(), DefinitionError> {
    let Some(schema) = &def.context_schema else {
        return Ok(());
    };
    if schema.allow_unknown {
        return Ok(());
    }
    for edge in edges {
        for source in &edge.sources {
            if let CriterionSource::Path { path } = source {
                let head = path.split('.').next().unwrap_or_default();
                if !schema.fields.contains_key(head) {
                    return Err(DefinitionError::Schema(format!(
                        "conditional edge from '{}' reads undeclared context field '{head}'",
                        edge.from
                    )));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
