//! CLI instance lifecycle subcommands.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use ensemble_types::workflow::{OperationResult, WorkflowInstance};

use super::{format_status, format_step_status, parse_json_arg, parse_uuid, print_json, short_id};
use crate::state::AppState;

/// Instance subcommands.
#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Create an instance of a workflow definition.
    Create {
        /// Definition ID.
        definition: String,

        /// Owning user.
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        owner: String,

        /// Initial user preferences as JSON.
        #[arg(long)]
        context: Option<String>,
    },

    /// List instances, oldest first.
    #[command(alias = "ls")]
    List {
        /// Only instances owned by this user.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show one instance.
    Show {
        /// Instance ID.
        id: String,
    },

    /// Start a created instance at its first step.
    Start {
        id: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Pause a running instance.
    Pause {
        id: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Resume a paused instance.
    Resume {
        id: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Cancel a running or paused instance.
    Cancel {
        id: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Skip the current step if it allows skipping.
    Skip {
        id: String,
        /// Why the step is skipped.
        #[arg(long)]
        reason: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Move the cursor to a named step.
    Goto {
        id: String,
        /// Target step ID.
        step: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Show the step attempt history.
    History {
        id: String,
    },

    /// Show the audit event trail.
    Events {
        id: String,
    },
}

/// Handle an instance subcommand.
pub async fn handle_instance_command(cmd: InstanceCommand, state: &AppState, json: bool) -> Result<()> {
    let manager = &state.manager;
    match cmd {
        InstanceCommand::Create {
            definition,
            owner,
            context,
        } => {
            let initial = context
                .as_deref()
                .map(parse_json_arg)
                .unwrap_or(serde_json::Value::Null);
            let instance = manager.create(&definition, &owner, initial).await?;
            if json {
                return print_json(&instance);
            }
            println!();
            println!(
                "  {} Created instance of '{}'",
                style("*").green().bold(),
                style(&definition).cyan()
            );
            println!("  ID: {}", instance.id);
            println!(
                "  Start it with: {}",
                style(format!("ensemble instance start {}", instance.id)).dim()
            );
            println!();
            Ok(())
        }
        InstanceCommand::List { owner } => {
            let instances = manager.list_instances(owner.as_deref()).await?;
            display_list(&instances, json)
        }
        InstanceCommand::Show { id } => {
            let instance = manager.get_instance(&parse_uuid(&id, "instance")?).await?;
            display_instance(state, &instance, json)
        }
        InstanceCommand::Start { id, actor } => {
            let id = parse_uuid(&id, "instance")?;
            report("start", manager.start(&id, &actor).await, json)
        }
        InstanceCommand::Pause { id, actor } => {
            let id = parse_uuid(&id, "instance")?;
            report("pause", manager.pause(&id, &actor).await, json)
        }
        InstanceCommand::Resume { id, actor } => {
            let id = parse_uuid(&id, "instance")?;
            report("resume", manager.resume(&id, &actor).await, json)
        }
        InstanceCommand::Cancel { id, actor } => {
            let id = parse_uuid(&id, "instance")?;
            report("cancel", manager.cancel(&id, &actor).await, json)
        }
        InstanceCommand::Skip { id, reason, actor } => {
            let id = parse_uuid(&id, "instance")?;
            report("skip", manager.skip_step(&id, &actor, &reason).await, json)
        }
        InstanceCommand::Goto { id, step, actor } => {
            let id = parse_uuid(&id, "instance")?;
            report("goto", manager.go_to_step(&id, &step, &actor).await, json)
        }
        InstanceCommand::History { id } => handle_history(state, &parse_uuid(&id, "instance")?, json).await,
        InstanceCommand::Events { id } => handle_events(state, &parse_uuid(&id, "instance")?, json).await,
    }
}

/// Print a lifecycle outcome as `{success, message}`.
///
/// A rejected transition still prints its outcome, then fails the command so
/// the exit status reflects it.
fn report<E: std::fmt::Display>(
    verb: &str,
    result: Result<WorkflowInstance, E>,
    json: bool,
) -> Result<()> {
    let outcome = OperationResult::from(result);
    if json {
        print_json(&outcome)?;
    } else if outcome.success {
        println!("  {} {}", style("✓").green(), outcome.message);
    }
    if !outcome.success {
        bail!("{verb} rejected: {}", outcome.message);
    }
    Ok(())
}

fn display_list(instances: &[WorkflowInstance], json: bool) -> Result<()> {
    if json {
        return print_json(&instances);
    }
    if instances.is_empty() {
        println!();
        println!("  No workflow instances.");
        println!(
            "  Create one with: {}",
            style("ensemble instance create <definition>").dim()
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
            Cell::new("Workflow"),
            Cell::new("Owner"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Updated"),
        ]);
    for i in instances {
        table.add_row(vec![
            Cell::new(short_id(&i.id)),
            Cell::new(&i.definition_id),
            Cell::new(&i.owner_id),
            format_status(i.status),
            Cell::new(i.current_step_index),
            Cell::new(i.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn display_instance(state: &AppState, instance: &WorkflowInstance, json: bool) -> Result<()> {
    if json {
        return print_json(instance);
    }

    let step = state
        .manager
        .catalog()
        .get(&instance.definition_id)
        .ok()
        .and_then(|def| {
            def.step_at(instance.current_step_index)
                .map(|s| format!("{} ({}/{})", s.id, instance.current_step_index, def.step_count()))
        })
        .unwrap_or_else(|| instance.current_step_index.to_string());

    println!();
    println!(
        "  {} {}",
        style("Instance:").bold(),
        style(instance.id).cyan()
    );
    println!("  Workflow: {}", instance.definition_id);
    println!("  Owner: {}", instance.owner_id);
    println!("  Status: {}", instance.status);
    println!("  Step: {step}");
    println!("  Created: {}", instance.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(t) = instance.paused_at {
        println!("  Paused: {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(t) = instance.completed_at {
        println!("  Completed: {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(t) = instance.cancelled_at {
        println!("  Cancelled: {}", style(t.format("%Y-%m-%d %H:%M:%S")).yellow());
    }
    println!();
    Ok(())
}

async fn handle_history(state: &AppState, id: &uuid::Uuid, json: bool) -> Result<()> {
    let history = state.manager.step_history(id).await?;
    if json {
        return print_json(&history);
    }
    if history.is_empty() {
        println!();
        println!("  No step attempts for instance '{}'.", short_id(id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Attempt"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Detail"),
        ]);
    for h in &history {
        let detail = h
            .error_message
            .as_ref()
            .or(h.reason.as_ref())
            .map(|e| e.chars().take(40).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&h.step_id),
            Cell::new(h.attempt),
            format_step_status(h.status),
            Cell::new(h.started_at.format("%H:%M:%S").to_string()),
            Cell::new(detail),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_events(state: &AppState, id: &uuid::Uuid, json: bool) -> Result<()> {
    let events = state.manager.events(id).await?;
    if json {
        return print_json(&events);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Time").fg(Color::Cyan),
            Cell::new("Event"),
            Cell::new("Actor"),
            Cell::new("Payload"),
        ]);
    for e in &events {
        table.add_row(vec![
            Cell::new(e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(e.event_type),
            Cell::new(&e.actor_id),
            Cell::new(e.payload.to_string().chars().take(60).collect::<String>()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}
