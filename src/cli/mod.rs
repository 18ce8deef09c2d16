//! Command-line interface.

pub mod app;
pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::agent::AgentArgs;
use commands::budget::BudgetArgs;
use commands::event::EventArgs;
use commands::team::TeamArgs;

/// Drover - drive teams of worker agents.
#[derive(Parser, Debug)]
#[command(name = "drover", version, about)]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to an explicit config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage teams of agents ("swarm" remains as a deprecated alias)
    #[command(alias = "swarm")]
    Team(TeamArgs),
    /// Manage individual agents
    Agent(AgentArgs),
    /// Inspect and follow the event stream
    Event(EventArgs),
    /// Inspect and adjust budgets
    Budget(BudgetArgs),
    /// Run the orchestrator in the foreground until interrupted
    Run,
}
