//! CLI command definitions and shared helpers for the `ensemble` binary.
//!
//! Uses clap derive macros. Commands are grouped by noun
//! (e.g., `ensemble instance start <id>`, `ensemble checkpoint list <id>`).

pub mod checkpoint;
pub mod context;
pub mod input;
pub mod instance;
pub mod workflow;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use ensemble_types::workflow::{InstanceStatus, StepHistoryStatus};
use serde_json::Value;
use uuid::Uuid;

/// Drive and inspect multi-agent workflow instances.
#[derive(Parser)]
#[command(name = "ensemble", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Workflow definitions (list, show, validate, add).
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Workflow instances (create, start, pause, resume, cancel, skip, goto, ...).
    #[command(alias = "i")]
    Instance {
        #[command(subcommand)]
        action: instance::InstanceCommand,
    },

    /// Instance checkpoints (create, list, show, restore).
    #[command(alias = "cp")]
    Checkpoint {
        #[command(subcommand)]
        action: checkpoint::CheckpointCommand,
    },

    /// Queued user inputs (enqueue, pending).
    Input {
        #[command(subcommand)]
        action: input::InputCommand,
    },

    /// Shared context (show, decide, artifact, prefs).
    #[command(alias = "ctx")]
    Context {
        #[command(subcommand)]
        action: context::ContextCommand,
    },
}

/// Tracing filter for the global verbosity flags.
pub fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,ensemble_core=debug",
        _ => "trace",
    }
}

pub fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

/// Parse a JSON argument; anything that is not valid JSON is taken as a string.
pub fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn format_status(status: InstanceStatus) -> Cell {
    match status {
        InstanceStatus::Created => Cell::new("created").fg(Color::Yellow),
        InstanceStatus::Running => Cell::new("running").fg(Color::Blue),
        InstanceStatus::Paused => Cell::new("paused").fg(Color::Magenta),
        InstanceStatus::Completed => Cell::new("completed").fg(Color::Green),
        InstanceStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}

pub fn format_step_status(status: StepHistoryStatus) -> Cell {
    match status {
        StepHistoryStatus::InProgress => Cell::new("in progress").fg(Color::Blue),
        StepHistoryStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepHistoryStatus::Skipped => Cell::new("skipped").fg(Color::DarkYellow),
        StepHistoryStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_lifecycle_command_with_global_flags() {
        let id = Uuid::now_v7().to_string();
        let cli = Cli::try_parse_from(["ensemble", "instance", "pause", &id, "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Instance {
                action: instance::InstanceCommand::Pause { .. }
            }
        ));
    }

    #[test]
    fn json_args_fall_back_to_strings() {
        assert_eq!(parse_json_arg(r#"{"tone":"formal"}"#), json!({"tone": "formal"}));
        assert_eq!(parse_json_arg("42"), json!(42));
        assert_eq!(parse_json_arg("postgres"), json!("postgres"));
    }

    #[test]
    fn verbosity_maps_to_filters() {
        assert_eq!(log_filter(0, true), "error");
        assert_eq!(log_filter(0, false), "warn");
        assert_eq!(log_filter(3, true), "trace");
    }

    #[test]
    fn invalid_uuid_is_reported() {
        let err = parse_uuid("nope", "instance").unwrap_err();
        assert!(err.to_string().contains("instance"));
    }
}
