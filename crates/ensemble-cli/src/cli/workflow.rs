//! CLI workflow definition subcommands.
//!
//! Definitions live as YAML files under `{data_dir}/workflows`; `add` copies a
//! validated file there so the next invocation's catalog picks it up.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use ensemble_core::workflow::DefinitionError;
use ensemble_core::workflow::definition::{load_definition_file, save_definition_file};
use ensemble_types::workflow::WorkflowDefinition;

use super::print_json;
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List loaded workflow definitions.
    #[command(alias = "ls")]
    List,

    /// Show a definition and its steps.
    Show {
        /// Definition ID.
        id: String,
    },

    /// Parse and validate a definition file without installing it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Validate a definition file and install it into the workflows directory.
    Add {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Replace an installed definition with the same ID.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::List => handle_list(state, json),
        WorkflowCommand::Show { id } => handle_show(&id, state, json),
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::Add { file, force } => handle_add(&file, force, state, json),
    }
}

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_definition_file(file).map_err(|e| match e {
        DefinitionError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        DefinitionError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })
}

fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let catalog = state.manager.catalog();

    if json {
        let out: Vec<_> = catalog
            .list()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "version": d.version,
                    "steps": d.step_count(),
                    "valid": catalog.validate(&d.id),
                })
            })
            .collect();
        return print_json(&out);
    }

    if catalog.is_empty() {
        println!();
        println!("  No workflows loaded from {}.", state.workflows_dir().display());
        println!(
            "  Add one with: {}",
            style("ensemble workflow add <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Steps"),
        ]);
    for d in catalog.list() {
        table.add_row(vec![
            Cell::new(&d.id),
            Cell::new(&d.name),
            Cell::new(&d.version),
            Cell::new(d.step_count()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let def = state.manager.catalog().get(id)?;
    if json {
        return print_json(def.as_ref());
    }

    println!();
    println!(
        "  {} {} {}",
        style("Workflow:").bold(),
        style(&def.name).cyan(),
        style(format!("({} v{})", def.id, def.version)).dim()
    );
    if let Some(desc) = &def.description {
        println!("  {desc}");
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Capability"),
            Cell::new("Required"),
            Cell::new("Skippable"),
            Cell::new("Timeout"),
        ]);
    for (i, step) in def.steps.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(step.name.as_deref().unwrap_or(&step.id)),
            Cell::new(&step.agent_capability),
            Cell::new(if step.required { "yes" } else { "no" }),
            Cell::new(if step.can_skip { "yes" } else { "no" }),
            Cell::new(
                step.timeout_secs
                    .map(|t| format!("{t}s"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    if json {
        return print_json(&serde_json::json!({
            "valid": true,
            "id": def.id,
            "steps": def.step_count(),
        }));
    }
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green(),
        style(&def.id).cyan(),
        def.step_count()
    );
    Ok(())
}

fn handle_add(file: &Path, force: bool, state: &AppState, json: bool) -> Result<()> {
    let def = load(file)?;
    let target = state.workflows_dir().join(format!("{}.yaml", def.id));
    if target.exists() && !force {
        bail!(
            "Workflow '{}' is already installed at {} (use --force to replace)",
            def.id,
            target.display()
        );
    }
    save_definition_file(&target, &def)?;
    tracing::info!(definition_id = %def.id, path = %target.display(), "workflow installed");

    if json {
        return print_json(&serde_json::json!({
            "id": def.id,
            "path": target.display().to_string(),
        }));
    }
    println!();
    println!(
        "  {} Installed workflow '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!("  Path: {}", target.display());
    println!("  Steps: {}", def.step_count());
    println!();
    Ok(())
}
