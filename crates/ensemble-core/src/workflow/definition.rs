//! Workflow definition parsing, validation, and filesystem discovery.
//!
//! Converts YAML files into `WorkflowDefinition` values, validates structural
//! constraints (non-empty ID, at least one step, a capability per step, unique
//! step IDs), and discovers definition files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ensemble_types::error::WorkflowError;
use ensemble_types::workflow::WorkflowDefinition;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<DefinitionError> for WorkflowError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::ValidationError(msg) => WorkflowError::ValidationError(msg),
            other => WorkflowError::ValidationError(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - ID and name are non-empty
/// - At least one step exists
/// - Every step has a non-empty ID and capability
/// - All step IDs are unique
/// - Step timeouts are > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "workflow '{}' must have a name",
            def.id
        )));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "workflow '{}' must have at least one step",
            def.id
        )));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "workflow '{}' has a step with an empty id",
                def.id
            )));
        }
        if step.agent_capability.trim().is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "step '{}' has no agent capability",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(DefinitionError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
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
/// are skipped with a warning. A missing directory yields no definitions.
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
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_definition_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                    }
                }
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

    const GREENFIELD: &str = r#"
id: greenfield-product
name: Greenfield Product
description: From idea to architecture
version: "2.1.0"
steps:
  - id: product-brief
    agent_capability: analyst
  - id: prd
    name: Product Requirements
    agent_capability: pm
    can_skip: true
    timeout_secs: 120
  - id: architecture
    capability: architect
metadata:
  track: enterprise
"#;

    #[test]
    fn test_parse_yaml() {
        let def = parse_definition_yaml(GREENFIELD).unwrap();
        assert_eq!(def.id, "greenfield-product");
        assert_eq!(def.version, "2.1.0");
        assert_eq!(def.steps.len(), 3);
        assert!(def.steps[1].can_skip);
        assert_eq!(def.steps[1].timeout_secs, Some(120));
        assert_eq!(def.steps[2].agent_capability, "architect");
        assert!(def.steps.iter().all(|s| s.required));
        assert_eq!(def.metadata["track"], serde_json::json!("enterprise"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let def = parse_definition_yaml(GREENFIELD).unwrap();
        let yaml = serialize_definition_yaml(&def).unwrap();
        let again = parse_definition_yaml(&yaml).unwrap();
        assert_eq!(again.id, def.id);
        assert_eq!(again.steps.len(), def.steps.len());
        assert_eq!(again.steps[1].name.as_deref(), Some("Product Requirements"));
    }

    #[test]
    fn test_validation_rejects_empty_steps() {
        let err = parse_definition_yaml("id: empty\nname: Empty\nsteps: []\n").unwrap_err();
        assert!(matches!(err, DefinitionError::ValidationError(_)));
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_validation_rejects_blank_capability() {
        let yaml = "id: x\nname: X\nsteps:\n  - id: a\n    agent_capability: \"  \"\n";
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("no agent capability"));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let yaml = r#"
id: dup
name: Dup
steps:
  - id: a
    agent_capability: pm
  - id: a
    agent_capability: architect
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let yaml = "id: x\nname: X\nsteps:\n  - id: a\n    agent_capability: pm\n    timeout_secs: 0\n";
        assert!(parse_definition_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_definition_yaml("id: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::ParseError(_)));
        let converted: WorkflowError = err.into();
        assert!(matches!(converted, WorkflowError::ValidationError(_)));
    }

    #[test]
    fn test_save_and_load_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("greenfield.yaml");
        let def = parse_definition_yaml(GREENFIELD).unwrap();

        save_definition_file(&path, &def).unwrap();
        let loaded = load_definition_file(&path).unwrap();
        assert_eq!(loaded.id, def.id);
    }

    #[test]
    fn test_discover_definitions_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("team")).unwrap();
        std::fs::write(dir.path().join("greenfield.yaml"), GREENFIELD).unwrap();
        std::fs::write(
            dir.path().join("team").join("small.yml"),
            "id: small\nname: Small\nsteps:\n  - id: only\n    agent_capability: dev\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "steps: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        let found = discover_definitions(dir.path()).unwrap();
        let mut ids: Vec<_> = found.iter().map(|(_, d)| d.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["greenfield-product", "small"]);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_definitions(Path::new("/definitely/not/here")).unwrap();
        assert!(found.is_empty());
    }
}
