//! CLI checkpoint subcommands.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use ensemble_types::workflow::CheckpointType;

use super::{format_status, parse_uuid, print_json, short_id};
use crate::state::AppState;

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// Save a checkpoint of an instance at its current step.
    Create {
        /// Instance ID.
        instance: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// List an instance's checkpoints, oldest first.
    #[command(alias = "ls")]
    List {
        /// Instance ID.
        instance: String,

        /// 1-based page number.
        #[arg(long, default_value = "1")]
        page: u32,

        /// Page size (engine default when omitted).
        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Show one checkpoint including its snapshot.
    Show {
        /// Checkpoint ID.
        checkpoint: String,
    },

    /// Restore an instance to a checkpoint.
    Restore {
        /// Instance ID.
        instance: String,
        /// Checkpoint ID.
        checkpoint: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },
}

/// Handle a checkpoint subcommand.
pub async fn handle_checkpoint_command(
    cmd: CheckpointCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let manager = &state.manager;
    match cmd {
        CheckpointCommand::Create { instance, actor } => {
            let instance_id = parse_uuid(&instance, "instance")?;
            let checkpoint = manager.create_checkpoint(&instance_id, &actor).await?;
            if json {
                return print_json(&checkpoint);
            }
            println!();
            println!(
                "  {} Checkpoint {} saved at step '{}'",
                style("*").green().bold(),
                style(checkpoint.id).cyan(),
                checkpoint.step_id
            );
            println!("  Context version: {}", checkpoint.snapshot.context_version);
            println!();
            Ok(())
        }

        CheckpointCommand::List {
            instance,
            page,
            page_size,
        } => {
            let instance_id = parse_uuid(&instance, "instance")?;
            let listing = manager
                .list_checkpoints(&instance_id, page, page_size)
                .await?;
            if json {
                return print_json(&listing);
            }
            if listing.items.is_empty() {
                println!();
                println!("  No checkpoints on page {} ({} total).", listing.page, listing.total);
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("ID").fg(Color::Cyan),
                    Cell::new("Type"),
                    Cell::new("Step"),
                    Cell::new("Status"),
                    Cell::new("Index"),
                    Cell::new("Ctx ver"),
                    Cell::new("By"),
                    Cell::new("Created"),
                ]);
            for c in &listing.items {
                let kind = match c.checkpoint_type {
                    CheckpointType::Automatic => Cell::new("auto").fg(Color::DarkGrey),
                    CheckpointType::ExplicitSave => Cell::new("saved").fg(Color::Green),
                };
                table.add_row(vec![
                    Cell::new(short_id(&c.id)),
                    kind,
                    Cell::new(&c.step_id),
                    format_status(c.snapshot.status),
                    Cell::new(c.snapshot.current_step_index),
                    Cell::new(c.snapshot.context_version),
                    Cell::new(&c.created_by),
                    Cell::new(c.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                ]);
            }
            println!();
            println!("{table}");
            println!(
                "  Page {} of {} checkpoint(s), {} per page",
                listing.page, listing.total, listing.page_size
            );
            println!();
            Ok(())
        }

        CheckpointCommand::Show { checkpoint } => {
            let checkpoint_id = parse_uuid(&checkpoint, "checkpoint")?;
            let checkpoint = manager.get_checkpoint(&checkpoint_id).await?;
            print_json(&checkpoint)
        }

        CheckpointCommand::Restore {
            instance,
            checkpoint,
            actor,
        } => {
            let instance_id = parse_uuid(&instance, "instance")?;
            let checkpoint_id = parse_uuid(&checkpoint, "checkpoint")?;
            let restored = manager
                .restore_checkpoint(&instance_id, &checkpoint_id, &actor)
                .await?;
            let context = manager.context(&instance_id).await?;
            if json {
                return print_json(&serde_json::json!({
                    "instance": restored,
                    "context_version": context.version,
                }));
            }
            println!(
                "  {} Restored to step {} ({}), context version {}",
                style("✓").green(),
                restored.current_step_index,
                restored.status,
                context.version
            );
            Ok(())
        }
    }
}
