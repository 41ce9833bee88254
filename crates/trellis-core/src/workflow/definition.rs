//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition`,
//! validates structural constraints (unique IDs, name, timeouts), and provides
//! discovery for workflow files on disk. Graph-level checks live in
//! [`super::graph::compile`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use trellis_types::workflow::{END_NODE, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading, validating or compiling a definition.
///
/// All of them are reported synchronously at creation time, before any step
/// executes.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry node '{0}' does not exist")]
    MissingEntry(String),

    /// An edge, default, branch or handler points at a node that does not exist.
    #[error("{context} references unknown node '{target}'")]
    UnknownNode { context: String, target: String },

    /// A node has more than one outgoing edge.
    #[error("node '{0}' has more than one outgoing edge")]
    Ambiguous(String),

    /// A conditional edge without default leaves possible values unmapped.
    #[error("conditional edge from '{node}' has no default and leaves values unmapped: {values:?}")]
    UnmappedCriterion { node: String, values: Vec<String> },

    /// Static edges alone form a cycle, which could never terminate.
    #[error("static cycle detected involving node '{0}'")]
    StaticCycle(String),

    #[error("nodes unreachable from entry: {0:?}")]
    Unreachable(Vec<String>),

    /// Context schema violation (initial context or criterion paths).
    #[error("context schema violation: {0}")]
    Schema(String),

    #[error("step '{step}' uses kind '{kind}' with no registered executor")]
    UnknownStepKind { step: String, kind: String },

    #[error("conditional edge from '{node}' uses unregistered function '{name}'")]
    UnknownFunction { node: String, name: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is structurally valid (it may still fail graph compilation).
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - ID and name are non-empty
/// - At least one step exists
/// - Step IDs are unique and never the reserved `__end__`
/// - Branch names do not shadow step IDs and branches are non-empty
/// - Timeouts and per-step `max_retries` are > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id == END_NODE {
            return Err(DefinitionError::Validation(format!(
                "step ID '{END_NODE}' is reserved"
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.kind.trim().is_empty() {
            return Err(DefinitionError::Validation(format!(
                "step '{}' has an empty kind",
                step.id
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(DefinitionError::Validation(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
        if step.max_retries == Some(0) {
            return Err(DefinitionError::Validation(format!(
                "step '{}' max_retries must be >= 1",
                step.id
            )));
        }
    }

    for (name, members) in &def.branches {
        if seen_ids.contains(name.as_str()) || name == END_NODE {
            return Err(DefinitionError::Validation(format!(
                "branch name '{name}' collides with a node ID"
            )));
        }
        if members.is_empty() {
            return Err(DefinitionError::Validation(format!(
                "branch '{name}' has no members"
            )));
        }
    }

    if let Some(retry) = &def.retry {
        if retry.max_retries == 0 {
            return Err(DefinitionError::Validation(
                "workflow max_retries must be >= 1".to_string(),
            ));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// are skipped with a warning.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_definition_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const REVIEW_YAML: &str = r#"
id: code-review
name: Code review
description: Analyze a change and decide whether to merge
entry: analyze
steps:
  - id: analyze
    kind: model
    input:
      diff: "{{ context.diff }}"
    timeout_secs: 120
  - id: merge
    kind: git
  - id: revise
    kind: model
    max_retries: 2
conditional_edges:
  - from: analyze
    sources:
      - type: path
        path: analysis.verdict
    destinations:
      approve: merge
      reject: revise
    default: revise
edges:
  - from: revise
    to: __end__
retry:
  max_retries: 3
  backoff:
    strategy: fixed
    delay_ms: 100
"#;

    // -----------------------------------------------------------------------
    // YAML roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_yaml_roundtrip() {
        let def = parse_definition_yaml(REVIEW_YAML).expect("should parse");
        assert_eq!(def.id, "code-review");
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.conditional_edges.len(), 1);
        assert_eq!(def.steps[0].timeout_secs, Some(120));

        let yaml2 = serialize_definition_yaml(&def).expect("should serialize");
        let def2 = parse_definition_yaml(&yaml2).expect("should re-parse");
        assert_eq!(def2.steps, def.steps);
        assert_eq!(def2.conditional_edges, def.conditional_edges);
        assert_eq!(def2.edges, def.edges);
        assert_eq!(def2.retry, def.retry);
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_definition_yaml("id: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let mut def = parse_definition_yaml(REVIEW_YAML).unwrap();
        def.steps[1].id = "analyze".to_string();
        let err = validate_definition(&def).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate step ID"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_empty_workflow() {
        let mut def = parse_definition_yaml(REVIEW_YAML).unwrap();
        def.steps.clear();
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("at least one step"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_empty_name() {
        let mut def = parse_definition_yaml(REVIEW_YAML).unwrap();
        def.name = "  ".to_string();
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("name must not be empty"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut def = parse_definition_yaml(REVIEW_YAML).unwrap();
        def.steps[0].timeout_secs = Some(0);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("timeout must be > 0"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_reserved_step_id() {
        let mut def = parse_definition_yaml(REVIEW_YAML).unwrap();
        def.steps[2].id = END_NODE.to_string();
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("reserved"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_branch_shadowing_step() {
        let mut def = parse_definition_yaml(REVIEW_YAML).unwrap();
        def.branches
            .insert("merge".to_string(), vec!["revise".to_string()]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("collides"), "got: {msg}");
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_save_and_load_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("review.yaml");
        let def = parse_definition_yaml(REVIEW_YAML).unwrap();

        save_definition_file(&path, &def).unwrap();
        let loaded = load_definition_file(&path).unwrap();
        assert_eq!(loaded.id, def.id);
        assert_eq!(loaded.steps, def.steps);
    }

    #[test]
    fn test_discover_skips_unparseable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("review.yaml"), REVIEW_YAML).unwrap();
        std::fs::write(dir.path().join("broken.yml"), "steps: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();
        let sub = dir.path().join("team");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("copy.yml"), REVIEW_YAML).unwrap();

        let found = discover_definitions(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|(_, def)| def.id == "code-review"));
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover_definitions(&dir.path().join("absent")).unwrap();
        assert!(found.is_empty());
    }
}
