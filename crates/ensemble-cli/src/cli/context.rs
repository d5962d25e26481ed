//! CLI shared-context subcommands.

use anyhow::Result;
use clap::Subcommand;
use console::style;

use ensemble_types::context::SharedContext;

use super::{parse_json_arg, parse_uuid, print_json};
use crate::state::AppState;

/// Context subcommands.
#[derive(Subcommand)]
pub enum ContextCommand {
    /// Show the shared context of an instance.
    Show {
        /// Instance ID.
        instance: String,

        /// Print the prompt view (summary when one is maintained).
        #[arg(long)]
        prompt: bool,
    },

    /// Record a decision.
    Decide {
        /// Instance ID.
        instance: String,
        /// Decision type (e.g. "database").
        decision_type: String,
        /// Decision value (JSON, or a plain string).
        value: String,
        /// Step the decision belongs to.
        #[arg(long)]
        step: Option<String>,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Add an artifact reference.
    Artifact {
        /// Instance ID.
        instance: String,
        name: String,
        uri: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Merge user preferences (JSON object keys overwrite).
    Prefs {
        /// Instance ID.
        instance: String,
        /// Preferences JSON.
        preferences: String,
        #[arg(long, env = "ENSEMBLE_ACTOR", default_value = "operator")]
        actor: String,
    },
}

/// Handle a context subcommand.
pub async fn handle_context_command(cmd: ContextCommand, state: &AppState, json: bool) -> Result<()> {
    let manager = &state.manager;
    let context = match cmd {
        ContextCommand::Show { instance, prompt } => {
            let context = manager.context(&parse_uuid(&instance, "instance")?).await?;
            if prompt && !json {
                println!("{}", context.prompt_view());
                return Ok(());
            }
            context
        }
        ContextCommand::Decide {
            instance,
            decision_type,
            value,
            step,
            actor,
        } => {
            manager
                .record_decision(
                    &parse_uuid(&instance, "instance")?,
                    &actor,
                    &decision_type,
                    parse_json_arg(&value),
                    step.as_deref(),
                )
                .await?
        }
        ContextCommand::Artifact {
            instance,
            name,
            uri,
            kind,
            actor,
        } => {
            manager
                .add_artifact_reference(
                    &parse_uuid(&instance, "instance")?,
                    &actor,
                    &name,
                    &uri,
                    kind.as_deref(),
                )
                .await?
        }
        ContextCommand::Prefs {
            instance,
            preferences,
            actor,
        } => {
            manager
                .set_user_preferences(
                    &parse_uuid(&instance, "instance")?,
                    &actor,
                    parse_json_arg(&preferences),
                )
                .await?
        }
    };

    if json {
        return print_json(&context);
    }
    display_context(&context);
    Ok(())
}

fn display_context(context: &SharedContext) {
    let content = &context.content;
    println!();
    println!(
        "  {} version {} (~{} tokens)",
        style("Context:").bold(),
        style(context.version).cyan(),
        context.estimated_token_count
    );
    println!("  Step outputs: {}", content.step_outputs.len());
    for output in content.outputs_by_completion() {
        println!(
            "    {} {}: {}",
            style("-").dim(),
            style(&output.step_id).cyan(),
            output.summary
        );
    }
    println!("  Decisions: {}", content.decision_history.len());
    for d in &content.decision_history {
        println!("    {} {}: {}", style("-").dim(), d.decision_type, d.value);
    }
    println!("  Artifacts: {}", content.artifact_references.len());
    for a in &content.artifact_references {
        println!("    {} {} <{}>", style("-").dim(), a.name, a.uri);
    }
    if let Some(prefs) = &content.user_preferences {
        println!("  Preferences: {prefs}");
    }
    if context.context_summary.is_some() {
        println!(
            "  {}",
            style("Summary maintained (over token limit); see --prompt").yellow()
        );
    }
    println!();
}
