//! Registry of workflow definitions, indexed by definition ID.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ensemble_types::error::WorkflowError;
use ensemble_types::workflow::WorkflowDefinition;

use super::definition::discover_definitions;

/// Read-only registry of immutable workflow definitions.
///
/// Definitions are added once with [`WorkflowCatalog::register`] and never
/// replaced. `register` accepts structurally incomplete definitions so that
/// [`WorkflowCatalog::validate`] can report on them; instance creation refuses
/// anything that does not validate.
#[derive(Debug, Default, Clone)]
pub struct WorkflowCatalog {
    definitions: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from every definition file under `dir`.
    ///
    /// When two files declare the same ID the first one (in path order) wins
    /// and the other is skipped with a warning.
    pub fn from_dir(dir: &Path) -> Result<Self, WorkflowError> {
        let mut catalog = Self::new();
        for (path, def) in discover_definitions(dir)? {
            let id = def.id.clone();
            if let Err(e) = catalog.register(def) {
                tracing::warn!(?path, definition_id = %id, error = %e, "skipping workflow file");
            }
        }
        tracing::debug!(count = catalog.len(), dir = %dir.display(), "loaded workflow catalog");
        Ok(catalog)
    }

    /// Add a definition. Rejects an ID that is already registered.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        if self.definitions.contains_key(&definition.id) {
            return Err(WorkflowError::ValidationError(format!(
                "workflow definition '{}' is already registered",
                definition.id
            )));
        }
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.definitions
            .get(definition_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow definition {definition_id}")))
    }

    /// True only if the definition exists, has steps, and every step names a
    /// capability.
    pub fn validate(&self, definition_id: &str) -> bool {
        self.definitions.get(definition_id).is_some_and(|def| {
            !def.steps.is_empty()
                && def
                    .steps
                    .iter()
                    .all(|s| !s.agent_capability.trim().is_empty())
        })
    }

    /// Definitions in ID order. Each call starts a fresh pass.
    pub fn list(&self) -> impl Iterator<Item = &Arc<WorkflowDefinition>> + '_ {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
