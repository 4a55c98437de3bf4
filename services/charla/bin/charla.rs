//! Main Entrypoint for the Charla voice client
//!
//! This binary is responsible for:
//! 1. Parsing the command line.
//! 2. Loading configuration from the environment.
//! 3. Initializing logging.
//! 4. Running one realtime voice session, or printing the tool definitions.

use anyhow::Context;
use charla_core::jokes;
use charla_service::{
    app::{print_tool_definitions, run_talk},
    cli::{Cli, Command},
    config::Config,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.command() == Command::Tools {
        return print_tool_definitions(&jokes::registry());
    }

    // --- 1. Load Configuration ---
    let config = Config::load(cli.broker_url).context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    // Logs go to stderr; stdout carries the conversation.
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        broker = %config.broker_url,
        model = %config.model,
        ice_servers = config.ice_servers.len(),
        "Configuration loaded. Starting voice session..."
    );

    // --- 3. Run the Session ---
    run_talk(&config).await
}
