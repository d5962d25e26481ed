//! CLI queued-input subcommands.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::{parse_json_arg, parse_uuid, print_json, short_id};
use crate::state::AppState;

/// Input subcommands.
#[derive(Subcommand)]
pub enum InputCommand {
    /// Queue an input; it is applied at the next checkpoint.
    Enqueue {
        /// Instance ID.
        instance: String,

        /// Input type: `artifact`, `preferences`, or any decision type.
        #[arg(long = "type")]
        input_type: String,

        /// Input content (JSON, or a plain string).
        content: String,

        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        user: String,
    },

    /// Show inputs waiting for the next checkpoint.
    Pending {
        /// Instance ID.
        instance: String,
    },
}

/// Handle an input subcommand.
pub async fn handle_input_command(cmd: InputCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        InputCommand::Enqueue {
            instance,
            input_type,
            content,
            user,
        } => {
            let instance_id = parse_uuid(&instance, "instance")?;
            let input = state
                .manager
                .enqueue_input(&instance_id, &user, &input_type, parse_json_arg(&content))
                .await?;
            if json {
                return print_json(&input);
            }
            println!(
                "  {} Queued {} input {} (applied at the next checkpoint)",
                style("✓").green(),
                style(&input.input_type).cyan(),
                short_id(&input.id)
            );
            Ok(())
        }

        InputCommand::Pending { instance } => {
            let instance_id = parse_uuid(&instance, "instance")?;
            let pending = state.manager.pending_inputs(&instance_id).await?;
            if json {
                return print_json(&pending);
            }
            if pending.is_empty() {
                println!();
                println!("  No pending inputs.");
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
                    Cell::new("User"),
                    Cell::new("Queued"),
                    Cell::new("Content"),
                ]);
            for i in &pending {
                table.add_row(vec![
                    Cell::new(short_id(&i.id)),
                    Cell::new(&i.input_type),
                    Cell::new(&i.user_id),
                    Cell::new(i.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                    Cell::new(i.content.to_string().chars().take(60).collect::<String>()),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }
    }
}
