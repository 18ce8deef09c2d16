//! Team CLI commands.

use clap::{Args, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

use crate::cli::output::{list_table, render_list, truncate};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{TeamStatus, TeamStrategy};
use crate::domain::ports::TeamFilter;
use crate::services::orchestrator::{ScaleRequest, TeamOrchestrator, TeamSpec};

#[derive(Args, Debug)]
pub struct TeamArgs {
    #[command(subcommand)]
    pub command: TeamCommands,
}

#[derive(Subcommand, Debug)]
pub enum TeamCommands {
    /// Create a team and launch its agents
    Create {
        /// Team name
        name: String,
        /// The shared task
        task: String,
        /// Number of agents
        #[arg(short, long, default_value_t = 3)]
        size: usize,
        /// Team budget in USD
        #[arg(short, long, default_value_t = 1.0)]
        budget: f64,
        /// Strategy: parallel, pipeline, map_reduce, tree
        #[arg(long, default_value = "parallel")]
        strategy: String,
        /// Autoscaling floor
        #[arg(long, default_value_t = 1)]
        min_size: usize,
        /// Autoscaling ceiling
        #[arg(long, default_value_t = 10)]
        max_size: usize,
        /// Enable autoscaling (parallel strategy only)
        #[arg(long)]
        autoscale: bool,
        /// Model for member agents
        #[arg(short, long)]
        model: Option<String>,
    },
    /// List teams
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show one team's status
    Status { team_id: String },
    /// Scale a team to a target size or by a signed delta
    Scale {
        team_id: String,
        /// Absolute target size
        #[arg(long, conflicts_with = "delta")]
        target: Option<usize>,
        /// Signed size change
        #[arg(long, allow_hyphen_values = true)]
        delta: Option<i64>,
    },
    /// Pause a team
    Pause { team_id: String },
    /// Resume a paused team
    Resume { team_id: String },
    /// Destroy a team, killing all members
    Destroy { team_id: String },
}

pub async fn handle(
    orchestrator: &Arc<TeamOrchestrator>,
    command: TeamCommands,
    json: bool,
) -> CoreResult<()> {
    match command {
        TeamCommands::Create {
            name,
            task,
            size,
            budget,
            strategy,
            min_size,
            max_size,
            autoscale,
            model,
        } => {
            let strategy = TeamStrategy::parse_str(&strategy)
                .ok_or_else(|| CoreError::InvalidInput(format!("unknown strategy: {strategy}")))?;
            let team_id = orchestrator
                .create_team(TeamSpec {
                    name,
                    task,
                    size,
                    min_size,
                    max_size,
                    budget,
                    strategy,
                    autoscale,
                    model,
                    ..Default::default()
                })
                .await?;
            if json {
                println!("{}", serde_json::json!({ "team_id": team_id }));
            } else {
                println!("Created team {team_id}");
            }
        }
        TeamCommands::List { status } => {
            let status = match status {
                Some(s) => Some(TeamStatus::parse_str(&s).ok_or_else(|| {
                    CoreError::InvalidInput(format!("unknown team status: {s}"))
                })?),
                None => None,
            };
            let teams = orchestrator.list(TeamFilter { status, ..Default::default() }).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&teams)?);
                return Ok(());
            }
            let mut table = list_table(&["id", "name", "status", "strategy", "agents", "budget"]);
            let total = teams.len();
            for team in teams {
                table.add_row(vec![
                    truncate(&team.id.to_string(), 9),
                    team.name.clone(),
                    team.status.to_string(),
                    team.config.strategy.as_str().to_string(),
                    team.agent_ids.len().to_string(),
                    format!("${:.4}", team.config.budget_allocated),
                ]);
            }
            println!("{}", render_list("team", &table, total));
        }
        TeamCommands::Status { team_id } => {
            let report = orchestrator.status(parse_id(&team_id)?).await?;
            if json {
                let counts: std::collections::HashMap<&str, usize> =
                    report.counts.iter().map(|(state, n)| (state.as_str(), *n)).collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "team": report.team,
                        "counts": counts,
                        "budget_consumed": report.budget_consumed,
                        "budget_remaining": report.budget_remaining,
                    })
                );
                return Ok(());
            }
            println!("Team {} ({})", report.team.name, report.team.id);
            println!("  status:    {}", report.team.status);
            println!("  strategy:  {}", report.team.config.strategy.as_str());
            println!("  members:   {}", report.team.agent_ids.len());
            for (state, count) in &report.counts {
                println!("    {state}: {count}");
            }
            println!(
                "  budget:    ${:.4} consumed / ${:.4} allocated",
                report.budget_consumed, report.team.config.budget_allocated
            );
        }
        TeamCommands::Scale { team_id, target, delta } => {
            let request = match (target, delta) {
                (Some(target), _) => ScaleRequest::Target(target),
                (None, Some(delta)) => ScaleRequest::Delta(delta),
                (None, None) => {
                    return Err(CoreError::InvalidInput("--target or --delta required".into()))
                }
            };
            orchestrator.scale(parse_id(&team_id)?, request).await?;
            println!("Scaled team {team_id}");
        }
        TeamCommands::Pause { team_id } => {
            orchestrator.pause_team(parse_id(&team_id)?, "operator").await?;
            println!("Paused team {team_id}");
        }
        TeamCommands::Resume { team_id } => {
            orchestrator.resume_team(parse_id(&team_id)?).await?;
            println!("Resumed team {team_id}");
        }
        TeamCommands::Destroy { team_id } => {
            orchestrator.destroy(parse_id(&team_id)?).await?;
            println!("Destroyed team {team_id}");
        }
    }
    Ok(())
}

pub(crate) fn parse_id(value: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| CoreError::InvalidInput(format!("not a valid id: {value}")))
}
