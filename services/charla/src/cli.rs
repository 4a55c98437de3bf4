use clap::{Parser, Subcommand};

/// Talk to a realtime voice model from the terminal.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Session broker endpoint. Overrides `BROKER_URL`.
    #[arg(long, global = true)]
    pub broker_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run one voice session. Lines typed on stdin are sent as text messages.
    Talk,
    /// Print the registered tool definitions as JSON.
    Tools,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Talk)
    }
}
