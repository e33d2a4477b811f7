//! Workflow definition parsing and validation.
//!
//! Definitions are authored as YAML (JSON parses too, being a YAML subset)
//! and deserialized into `WorkflowDefinition`. Validation covers the graph
//! rules from [`graph`](super::graph) plus definition-level checks.

use std::path::Path;

use orchestra_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::graph::{GraphError, build_levels};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("invalid workflow: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML (or JSON) workflow definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load a workflow definition file from disk.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition before any run is created.
///
/// Checks:
/// - Name is non-empty
/// - Every stage names a capability
/// - The stage graph levels cleanly (see `build_levels`)
/// - `terminal_stage`, if set, names a declared stage
/// - `timeout_ms`, if set, is non-zero
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::Invalid(
            "workflow name must not be empty".to_string(),
        ));
    }

    for stage in &def.stages {
        if stage.capability.trim().is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "stage '{}' has no capability",
                stage.id
            )));
        }
        if stage.timeout_ms == Some(0) {
            return Err(DefinitionError::Invalid(format!(
                "stage '{}' timeout must be > 0",
                stage.id
            )));
        }
    }

    build_levels(&def.stages)?;

    if let Some(terminal) = &def.terminal_stage {
        if !def.stages.iter().any(|s| &s.id == terminal) {
            return Err(DefinitionError::Invalid(format!(
                "terminal stage '{terminal}' is not declared"
            )));
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
    use serde_json::json;

    const DIGEST_YAML: &str = r#"
name: digest
terminal_stage: translate
stages:
  - id: s1
    capability: sum
    input:
      url: "${workflow.input.url}"
  - id: translate
    capability: translate
    input:
      text: "${s1.output.summary}"
    dependencies: [s1]
    timeout_ms: 5000
    max_retries: 2
    resource:
      resource_type: document
      resource_id: doc-1
      strategy: queue
"#;

    #[test]
    fn parses_yaml_definition() {
        let def = parse_workflow_yaml(DIGEST_YAML).unwrap();
        assert_eq!(def.name, "digest");
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[1].dependencies, vec!["s1"]);
        assert_eq!(def.stages[1].max_retries, Some(2));
        assert_eq!(def.stages[1].input, json!({"text": "${s1.output.summary}"}));
        assert_eq!(def.terminal_stage.as_deref(), Some("translate"));
    }

    #[test]
    fn parses_json_definition() {
        let src = r#"{"name":"x","stages":[{"id":"s1","capability":"sum","input":{},"dependencies":[]}]}"#;
        let def = parse_workflow_yaml(src).unwrap();
        assert_eq!(def.stages[0].id, "s1");
    }

    #[test]
    fn rejects_cycle_with_stage_name() {
        let src = r#"
name: loop
stages:
  - { id: a, capability: x, dependencies: [b] }
  - { id: b, capability: x, dependencies: [a] }
"#;
        let err = parse_workflow_yaml(src).unwrap_err();
        assert!(matches!(err, DefinitionError::Graph(GraphError::CycleDetected(_))));
    }

    #[test]
    fn rejects_unknown_terminal_stage() {
        let src = r#"
name: t
terminal_stage: nope
stages:
  - { id: a, capability: x }
"#;
        let err = parse_workflow_yaml(src).unwrap_err();
        assert!(err.to_string().contains("terminal stage 'nope'"));
    }

    #[test]
    fn rejects_blank_capability_and_zero_timeout() {
        let src = "name: t\nstages:\n  - { id: a, capability: '' }\n";
        assert!(parse_workflow_yaml(src).unwrap_err().to_string().contains("no capability"));

        let src = "name: t\nstages:\n  - { id: a, capability: x, timeout_ms: 0 }\n";
        assert!(parse_workflow_yaml(src).unwrap_err().to_string().contains("timeout"));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        let err = parse_workflow_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digest.yaml");
        std::fs::write(&path, DIGEST_YAML).unwrap();
        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.name, "digest");

        let missing = load_workflow_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, DefinitionError::Io(_)));
    }
}
