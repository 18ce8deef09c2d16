//! Autoscaling control loop for parallel teams.
//!
//! Samples member utilization and nudges team size by one in either
//! direction. Changes are throttled by a minimum interval per team, and
//! scale-down requires a sustained low-utilization window, so the loop
//! cannot oscillate.

use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::domain::models::{AgentState, BudgetScope, BudgetWindow, TeamStatus};
use crate::domain::ports::TeamFilter;

use super::{ScaleRequest, TeamOrchestrator};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

impl TeamOrchestrator {
    pub(super) async fn run_autoscaler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let teams = match self
                .teams
                .list(TeamFilter { status: Some(TeamStatus::Running), ..Default::default() })
                .await
            {
                Ok(teams) => teams,
                Err(e) => {
                    tracing::warn!("autoscaler team listing failed: {e}");
                    continue;
                }
            };
            for team in teams.into_iter().filter(|t| t.config.autoscale) {
                if let Err(e) = self.sample_team(team.id).await {
                    tracing::warn!(team_id = %team.id, "autoscale sample failed: {e}");
                }
            }
        }
    }

    async fn sample_team(&self, team_id: Uuid) -> crate::domain::errors::CoreResult<()> {
        let team = self.load(team_id).await?;
        let members = self.agents.list_by_team(team_id).await?;
        let live: Vec<_> = members.iter().filter(|a| a.state.is_live()).collect();
        if live.is_empty() {
            return Ok(());
        }
        let running = live.iter().filter(|a| a.state == AgentState::Running).count();
        let idle_fraction = 1.0 - (running as f64 / live.len() as f64);

        let throttled = {
            let last = self
                .last_scaled
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last.get(&team_id).is_some_and(|at| {
                at.elapsed() < Duration::from_secs(self.config.autoscale_min_interval_secs)
            })
        };

        // Fully busy: add one member if the budget still carries it.
        if running == live.len() && live.len() < team.config.max_size {
            self.clear_idle_mark(team_id);
            if throttled {
                return Ok(());
            }
            let remaining = self
                .budget
                .get(&BudgetScope::Team(team_id), BudgetWindow::Lifetime)
                .await?
                .and_then(|r| r.limit_cost.map(|limit| (limit - r.cost_usd).max(0.0)))
                .unwrap_or(0.0);
            if remaining >= team.config.per_agent_budget() {
                tracing::info!(%team_id, size = live.len(), "autoscaler scaling up");
                self.scale(team_id, ScaleRequest::Delta(1)).await?;
            }
            return Ok(());
        }

        // Under-utilized: scale down only after the low watermark holds.
        if idle_fraction >= 0.5 && live.len() > team.config.min_size {
            let sustained = {
                let mut idle_since = self
                    .idle_since
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let since = idle_since.entry(team_id).or_insert_with(Instant::now);
                since.elapsed() >= Duration::from_secs(self.config.autoscale_low_watermark_secs)
            };
            if sustained && !throttled {
                tracing::info!(%team_id, size = live.len(), "autoscaler scaling down");
                self.clear_idle_mark(team_id);
                self.scale(team_id, ScaleRequest::Delta(-1)).await?;
            }
        } else {
            self.clear_idle_mark(team_id);
        }
        Ok(())
    }

    fn clear_idle_mark(&self, team_id: Uuid) {
        self.idle_since
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&team_id);
    }
}
