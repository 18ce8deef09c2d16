//! Agent CLI commands.

use clap::{Args, Subcommand};
use std::sync::Arc;

use crate::cli::commands::team::parse_id;
use crate::cli::output::{list_table, render_list, truncate};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::AgentState;
use crate::domain::ports::AgentFilter;
use crate::services::lifecycle::{LifecycleManager, SpawnOptions};

#[derive(Args, Debug)]
pub struct AgentArgs {
    #[command(subcommand)]
    pub command: AgentCommands,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Spawn a standalone agent
    Spawn {
        /// The task text
        task: String,
        /// Model to run on
        #[arg(short, long)]
        model: Option<String>,
        /// Human-facing label
        #[arg(short, long)]
        label: Option<String>,
        /// Cost ceiling in USD
        #[arg(short, long)]
        budget: Option<f64>,
        /// Maximum spawn retries
        #[arg(long)]
        max_retries: Option<u32>,
        /// Parent agent id (sub-agent spawn)
        #[arg(long)]
        parent: Option<String>,
    },
    /// List agents
    List {
        /// Filter by state
        #[arg(short, long)]
        state: Option<String>,
        /// Filter by team
        #[arg(short, long)]
        team: Option<String>,
    },
    /// Show one agent
    Status { agent_id: String },
    /// Pause a running agent
    Pause { agent_id: String },
    /// Resume a paused agent
    Resume { agent_id: String },
    /// Kill an agent
    Kill { agent_id: String },
    /// Retry a failed agent
    Retry { agent_id: String },
}

pub async fn handle(
    lifecycle: &Arc<LifecycleManager>,
    command: AgentCommands,
    json: bool,
) -> CoreResult<()> {
    match command {
        AgentCommands::Spawn { task, model, label, budget, max_retries, parent } => {
            let parent_id = parent.as_deref().map(parse_id).transpose()?;
            let agent_id = lifecycle
                .spawn(
                    task,
                    SpawnOptions {
                        model,
                        label,
                        budget_limit: budget,
                        max_retries,
                        parent_id,
                        ..Default::default()
                    },
                )
                .await?;
            if json {
                println!("{}", serde_json::json!({ "agent_id": agent_id }));
            } else {
                println!("Spawned agent {agent_id}");
            }
        }
        AgentCommands::List { state, team } => {
            let state = match state {
                Some(s) => Some(AgentState::parse_str(&s).ok_or_else(|| {
                    CoreError::InvalidInput(format!("unknown agent state: {s}"))
                })?),
                None => None,
            };
            let team_id = team.as_deref().map(parse_id).transpose()?;
            let agents = lifecycle
                .list(AgentFilter { state, team_id, ..Default::default() })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
                return Ok(());
            }
            let mut table =
                list_table(&["id", "label", "state", "model", "retries", "spawned"]);
            let total = agents.len();
            for agent in agents {
                table.add_row(vec![
                    truncate(&agent.id.to_string(), 9),
                    agent.display_name(),
                    agent.state.to_string(),
                    agent.model.clone(),
                    format!("{}/{}", agent.retry_count, agent.max_retries),
                    agent.spawned_at.format("%H:%M:%S").to_string(),
                ]);
            }
            println!("{}", render_list("agent", &table, total));
        }
        AgentCommands::Status { agent_id } => {
            let agent = lifecycle.get(parse_id(&agent_id)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&agent)?);
                return Ok(());
            }
            println!("Agent {} ({})", agent.display_name(), agent.id);
            println!("  state:     {}", agent.state);
            println!("  model:     {}", agent.model);
            println!("  task:      {}", truncate(&agent.task, 72));
            println!("  retries:   {}/{}", agent.retry_count, agent.max_retries);
            println!("  budget:    ${:.4}", agent.budget_limit);
            if let Some(team_id) = agent.team_id {
                println!("  team:      {team_id}");
            }
            if let Some(session) = &agent.session_key {
                println!("  session:   {session}");
            }
            if let Some(error) = &agent.last_error {
                println!("  last error: {error}");
            }
        }
        AgentCommands::Pause { agent_id } => {
            lifecycle.pause(parse_id(&agent_id)?).await?;
            println!("Paused agent {agent_id}");
        }
        AgentCommands::Resume { agent_id } => {
            lifecycle.resume(parse_id(&agent_id)?).await?;
            println!("Resumed agent {agent_id}");
        }
        AgentCommands::Kill { agent_id } => {
            lifecycle.kill(parse_id(&agent_id)?, "operator").await?;
            println!("Killed agent {agent_id}");
        }
        AgentCommands::Retry { agent_id } => {
            lifecycle.retry(parse_id(&agent_id)?).await?;
            println!("Retrying agent {agent_id}");
        }
    }
    Ok(())
}
