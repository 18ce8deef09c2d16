//! Budget CLI commands.

use clap::{Args, Subcommand};
use std::sync::Arc;

use crate::cli::commands::team::parse_id;
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{BudgetScope, BudgetWindow};
use crate::services::budget::BudgetController;

#[derive(Args, Debug)]
pub struct BudgetArgs {
    #[command(subcommand)]
    pub command: BudgetCommands,
}

#[derive(Subcommand, Debug)]
pub enum BudgetCommands {
    /// Set a hard cost limit on a scope
    Set {
        /// Scope: global, agent:<id>, team:<id>, project:<name>
        scope: String,
        /// Limit in USD
        limit: f64,
        /// Window: day or lifetime
        #[arg(short, long, default_value = "lifetime")]
        window: String,
    },
    /// Show counters for a scope
    Status {
        /// Scope: global, agent:<id>, team:<id>, project:<name>
        #[arg(default_value = "global")]
        scope: String,
    },
    /// Reset counters for a scope
    Reset {
        scope: String,
        #[arg(short, long, default_value = "day")]
        window: String,
    },
}

pub async fn handle(
    budget: &Arc<BudgetController>,
    command: BudgetCommands,
    json: bool,
) -> CoreResult<()> {
    match command {
        BudgetCommands::Set { scope, limit, window } => {
            let scope = parse_scope(&scope)?;
            let window = parse_window(&window)?;
            budget.set_limit(&scope, window, limit).await?;
            println!("Set {scope} {} limit to ${limit:.4}", window.as_str());
        }
        BudgetCommands::Status { scope } => {
            let scope = parse_scope(&scope)?;
            for window in [BudgetWindow::Day, BudgetWindow::Lifetime] {
                let record = budget.get(&scope, window).await?;
                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "window": window.as_str(), "record": record })
                    );
                    continue;
                }
                match record {
                    Some(record) => {
                        let limit = record
                            .limit_cost
                            .map_or("unlimited".to_string(), |l| format!("${l:.4}"));
                        println!(
                            "{} [{}]: ${:.4} of {} ({} in / {} out tokens){}",
                            scope,
                            window.as_str(),
                            record.cost_usd,
                            limit,
                            record.tokens_in,
                            record.tokens_out,
                            if record.exhausted { " EXHAUSTED" } else { "" },
                        );
                    }
                    None => println!("{} [{}]: no usage recorded", scope, window.as_str()),
                }
            }
        }
        BudgetCommands::Reset { scope, window } => {
            let scope = parse_scope(&scope)?;
            let window = parse_window(&window)?;
            budget.reset(&scope, window).await?;
            println!("Reset {scope} [{}]", window.as_str());
        }
    }
    Ok(())
}

fn parse_scope(value: &str) -> CoreResult<BudgetScope> {
    if value == "global" {
        return Ok(BudgetScope::Global);
    }
    match value.split_once(':') {
        Some(("agent", id)) => Ok(BudgetScope::Agent(parse_id(id)?)),
        Some(("team", id)) => Ok(BudgetScope::Team(parse_id(id)?)),
        Some(("project", name)) => Ok(BudgetScope::Project(name.to_string())),
        _ => Err(CoreError::InvalidInput(format!(
            "scope must be global, agent:<id>, team:<id>, or project:<name>, got {value}"
        ))),
    }
}

fn parse_window(value: &str) -> CoreResult<BudgetWindow> {
    BudgetWindow::parse_str(value)
        .ok_or_else(|| CoreError::InvalidInput(format!("window must be day or lifetime: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope() {
        assert!(matches!(parse_scope("global"), Ok(BudgetScope::Global)));
        assert!(matches!(parse_scope("project:improvement"), Ok(BudgetScope::Project(_))));
        assert!(parse_scope("bogus").is_err());
        assert!(parse_scope("agent:not-a-uuid").is_err());
    }
}
