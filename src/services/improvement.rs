//! Auto-improvement loop.
//!
//! A scheduled self-inspection: run a fixed set of cheap health checks,
//! turn each failing check into a bounded work unit, and spawn a tightly
//! budgeted single-agent team per unit. Improvement teams may not spawn
//! sub-agents, may not touch paths outside the allow-list, and draw from
//! their own daily ceiling rather than operator budgets.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::domain::errors::CoreResult;
use crate::domain::models::config::ImprovementConfig;
use crate::domain::models::{
    AgentState, BudgetScope, BudgetWindow, Event, EventPayload, TaskSpec, TeamStrategy,
};
use crate::domain::ports::{AgentFilter, AgentRepository};
use crate::services::budget::BudgetController;
use crate::services::event_bus::EventBus;
use crate::services::orchestrator::{TeamOrchestrator, TeamSpec};

const SOURCE: &str = "improvement";
const PROJECT_SCOPE: &str = "improvement";

/// One health check result.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: &'static str,
    pub value: f64,
    pub threshold: f64,
}

impl HealthCheck {
    pub fn failing(&self) -> bool {
        self.value > self.threshold
    }
}

/// A bounded task produced by a failing check.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub check: &'static str,
    pub objective: String,
    pub max_cost: f64,
}

/// Summary of one cycle, also published as `auto_improvement_cycle`.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub checks: Vec<HealthCheck>,
    pub teams_spawned: usize,
}

/// The periodic self-inspection loop.
pub struct ImprovementLoop {
    me: Weak<ImprovementLoop>,
    orchestrator: Arc<TeamOrchestrator>,
    agents: Arc<dyn AgentRepository>,
    budget: Arc<BudgetController>,
    bus: Arc<EventBus>,
    config: ImprovementConfig,
}

impl ImprovementLoop {
    pub fn new(
        orchestrator: Arc<TeamOrchestrator>,
        agents: Arc<dyn AgentRepository>,
        budget: Arc<BudgetController>,
        bus: Arc<EventBus>,
        config: ImprovementConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self { me: me.clone(), orchestrator, agents, budget, bus, config })
    }

    /// Install the dedicated daily ceiling and start the cycle timer.
    pub async fn start(&self) -> CoreResult<tokio::task::JoinHandle<()>> {
        self.ensure_ceiling().await?;

        let improvement = self.me.upgrade().ok_or_else(|| {
            crate::domain::errors::CoreError::internal(std::io::Error::other(
                "improvement loop dropped before start",
            ))
        })?;
        Ok(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(improvement.config.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh process
            // does not inspect an empty system.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match improvement.run_cycle().await {
                    Ok(summary) => {
                        tracing::info!(
                            checks = summary.checks.len(),
                            teams = summary.teams_spawned,
                            "improvement cycle complete"
                        );
                    }
                    Err(e) => tracing::warn!("improvement cycle failed: {e}"),
                }
            }
        }))
    }

    /// The improvement ceiling is an ordinary budget scope, so the debit
    /// ladder enforces it with no special cases.
    async fn ensure_ceiling(&self) -> CoreResult<()> {
        self.budget
            .set_limit(
                &BudgetScope::Project(PROJECT_SCOPE.to_string()),
                BudgetWindow::Day,
                self.config.daily_cost_cap,
            )
            .await
    }

    /// One inspection cycle. Bounded: the checks are fixed queries, and
    /// each spawned team is clipped to the cycle's hard cap.
    pub async fn run_cycle(&self) -> CoreResult<CycleSummary> {
        self.ensure_ceiling().await?;
        let checks = self.run_health_checks().await?;
        let failing: Vec<&HealthCheck> = checks.iter().filter(|c| c.failing()).collect();

        let mut teams_spawned = 0usize;
        for check in &failing {
            let unit = self.work_unit_for(check);
            match self.spawn_unit(&unit).await {
                Ok(true) => teams_spawned += 1,
                Ok(false) => {
                    tracing::info!(check = unit.check, "improvement unit skipped: ceiling reached");
                }
                Err(e) => tracing::warn!(check = unit.check, "improvement unit failed: {e}"),
            }
        }

        self.bus
            .publish(Event::new(
                SOURCE,
                EventPayload::AutoImprovementCycle {
                    checks_run: checks.len(),
                    checks_failed: failing.len(),
                    teams_spawned,
                },
            ))
            .await;

        Ok(CycleSummary { checks, teams_spawned })
    }

    async fn run_health_checks(&self) -> CoreResult<Vec<HealthCheck>> {
        let agents = self.agents.list(AgentFilter::default()).await?;
        let terminal =
            agents.iter().filter(|a| a.state.is_terminal()).count();
        let failed = agents.iter().filter(|a| a.state == AgentState::Failed).count();
        let failed_fraction = if terminal == 0 { 0.0 } else { failed as f64 / terminal as f64 };

        let dropped = self.bus.dropped_total() as f64;

        let burn = self
            .budget
            .get(&BudgetScope::Global, BudgetWindow::Day)
            .await?
            .and_then(|r| r.consumed_fraction())
            .unwrap_or(0.0);

        Ok(vec![
            HealthCheck {
                name: "failed_agent_fraction",
                value: failed_fraction,
                threshold: self.config.failed_fraction_threshold,
            },
            HealthCheck {
                name: "bus_dropped_events",
                value: dropped,
                threshold: self.config.bus_drop_threshold as f64,
            },
            HealthCheck {
                name: "daily_budget_burn",
                value: burn,
                threshold: self.config.burn_rate_threshold,
            },
        ])
    }

    fn work_unit_for(&self, check: &HealthCheck) -> WorkUnit {
        let objective = match check.name {
            "failed_agent_fraction" => format!(
                "Investigate recent agent failures ({:.0}% of terminal agents). \
                 Summarize the dominant error classes and propose fixes.",
                check.value * 100.0
            ),
            "bus_dropped_events" => format!(
                "The event bus dropped {} events from slow subscriptions. \
                 Identify the lagging subscribers and recommend queue sizing.",
                check.value as u64
            ),
            _ => format!(
                "Daily budget burn is at {:.0}% of the cap. Review running teams \
                 for waste and recommend scale-downs.",
                check.value * 100.0
            ),
        };
        WorkUnit { check: check.name, objective, max_cost: self.config.cycle_cost_cap }
    }

    /// Spawn one improvement team, drawing from the dedicated ceiling.
    /// Returns false when the ceiling has no room left.
    async fn spawn_unit(&self, unit: &WorkUnit) -> CoreResult<bool> {
        let scope = BudgetScope::Project(PROJECT_SCOPE.to_string());
        match self.budget.reserve(&scope, BudgetWindow::Day, unit.max_cost).await {
            Ok(()) => {}
            Err(crate::domain::errors::CoreError::BudgetDenied(_)) => return Ok(false),
            Err(e) => return Err(e),
        }

        let spec = TeamSpec {
            name: format!("improve-{}", unit.check.replace('_', "-")),
            task: unit.objective.clone(),
            size: 1,
            min_size: 1,
            max_size: 1,
            budget: unit.max_cost,
            strategy: TeamStrategy::Parallel,
            failure_budget: 0,
            autoscale: false,
            allow_subagents: false,
            model: None,
            context: [(
                "task_spec".to_string(),
                serde_json::to_string(
                    &TaskSpec::new(unit.objective.clone())
                        .with_scope(self.config.scope_allowlist.clone()),
                )?,
            )]
            .into_iter()
            .collect(),
        };
        self.orchestrator.create_team(spec).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_failing() {
        let ok = HealthCheck { name: "x", value: 0.1, threshold: 0.25 };
        assert!(!ok.failing());
        let bad = HealthCheck { name: "x", value: 0.3, threshold: 0.25 };
        assert!(bad.failing());
    }
}
