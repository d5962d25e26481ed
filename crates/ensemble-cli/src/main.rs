//! Ensemble CLI entry point.
//!
//! Binary name: `ensemble`
//!
//! Parses CLI arguments, initializes tracing, the database and the workflow
//! engine, then dispatches to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    ensemble_observe::init_tracing(cli::log_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    ensemble_observe::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Initialize application state (DB, catalog, engine)
    let state = AppState::init().await?;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Instance { action } => {
            cli::instance::handle_instance_command(action, &state, cli.json).await
        }
        Commands::Checkpoint { action } => {
            cli::checkpoint::handle_checkpoint_command(action, &state, cli.json).await
        }
        Commands::Input { action } => {
            cli::input::handle_input_command(action, &state, cli.json).await
        }
        Commands::Context { action } => {
            cli::context::handle_context_command(action, &state, cli.json).await
        }
    }
}
