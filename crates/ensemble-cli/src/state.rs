//! Application state wiring the engine to its SQLite store.
//!
//! The engine is generic over its store; `AppState` pins it to
//! `SqliteWorkflowStore` and loads the catalog from `{data_dir}/workflows`.

use std::path::PathBuf;
use std::sync::Arc;

use ensemble_core::workflow::{AgentRegistry, WorkflowCatalog, WorkflowInstanceManager};
use ensemble_infra::config::{WORKFLOWS_DIR, database_url, load_engine_config, resolve_data_dir};
use ensemble_infra::sqlite::{DatabasePool, SqliteWorkflowStore};

pub type ConcreteManager = WorkflowInstanceManager<SqliteWorkflowStore>;

/// Shared state for CLI commands.
pub struct AppState {
    pub manager: Arc<ConcreteManager>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the engine under the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    /// Create the data directory, open the database, load config and catalog.
    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir.join(WORKFLOWS_DIR)).await?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let catalog = WorkflowCatalog::from_dir(&data_dir.join(WORKFLOWS_DIR))?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            definitions = catalog.len(),
            "application state ready"
        );

        // Agents are supplied by embedding applications; the CLI only drives
        // lifecycle, checkpoint, input and context operations.
        let manager = WorkflowInstanceManager::new(
            Arc::new(SqliteWorkflowStore::new(pool)),
            catalog,
            AgentRegistry::new(),
            config,
        );

        Ok(Self {
            manager: Arc::new(manager),
            data_dir,
        })
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join(WORKFLOWS_DIR)
    }
}
