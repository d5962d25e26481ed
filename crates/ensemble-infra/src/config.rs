//! Data directory and engine configuration loading for Ensemble.
//!
//! Reads `config.toml` from the data directory (`~/.ensemble/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use ensemble_types::config::EngineConfig;

/// File name of the engine configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";
/// Directory of workflow definition files inside the data directory.
pub const WORKFLOWS_DIR: &str = "workflows";
/// SQLite database file inside the data directory.
pub const DATABASE_FILE: &str = "ensemble.db";

/// Resolve the Ensemble data directory.
///
/// Priority:
/// 1. `ENSEMBLE_DATA_DIR` environment variable
/// 2. `~/.ensemble`
/// 3. `.ensemble` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ENSEMBLE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".ensemble");
    }
    PathBuf::from(".ensemble")
}

/// SQLite URL for the database inside `data_dir`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join(DATABASE_FILE).display())
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: a warning, then the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
