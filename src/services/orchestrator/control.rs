//! Team control operations: scale, pause, resume, destroy.
//!
//! Every operation serializes on the team lock; member kills are issued
//! through the lifecycle manager, which acquires agent locks in ascending
//! id order.

use std::time::Instant;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Agent, AgentState, EventPayload, TeamStatus};

use super::TeamOrchestrator;

/// A scale request: signed delta or absolute target.
#[derive(Debug, Clone, Copy)]
pub enum ScaleRequest {
    Delta(i64),
    Target(usize),
}

impl TeamOrchestrator {
    /// Scale a team up or down. The final size is clamped silently into
    /// `[min_size, max_size]`; the clamp is visible in the `team_scaled`
    /// event's effective sizes.
    pub async fn scale(&self, team_id: Uuid, request: ScaleRequest) -> CoreResult<()> {
        let lock = self.lock_for(team_id);
        let _guard = lock.lock().await;

        let mut team = self.load(team_id).await?;
        if team.status.is_terminal() {
            return Err(CoreError::InvalidState {
                entity: "team",
                id: team_id.to_string(),
                state: team.status.to_string(),
                operation: "scale",
            });
        }

        let members = self.agents.list_by_team(team_id).await?;
        let live: Vec<&Agent> = members.iter().filter(|a| a.state.is_live()).collect();
        let current = live.len();

        let requested = match request {
            ScaleRequest::Delta(delta) => (current as i64 + delta).max(0) as usize,
            ScaleRequest::Target(target) => target,
        };
        let target = team.config.clamp_size(requested);
        let requested_delta = requested as i64 - current as i64;

        if target > current {
            for index in 0..(target - current) {
                let agent_id = self.spawn_member(&team, team.agent_ids.len() + index).await?;
                team.agent_ids.push(agent_id);
            }
        } else if target < current {
            let victims = select_victims(&live, current - target);
            self.lifecycle.kill_many(victims, "scaled_down").await?;
        }

        team.config.desired_size = target;
        self.teams.update(&team).await?;
        self.last_scaled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(team_id, Instant::now());
        self.emit(
            team_id,
            EventPayload::TeamScaled { from_size: current, to_size: target, requested_delta },
        )
        .await;
        Ok(())
    }

    /// Pause a team: suspend members and mark the team paused.
    pub async fn pause_team(&self, team_id: Uuid, reason: &str) -> CoreResult<()> {
        let lock = self.lock_for(team_id);
        let _guard = lock.lock().await;

        let mut team = self.load(team_id).await?;
        match team.status {
            TeamStatus::Paused => return Ok(()),
            TeamStatus::Running => {}
            _ => {
                return Err(CoreError::InvalidState {
                    entity: "team",
                    id: team_id.to_string(),
                    state: team.status.to_string(),
                    operation: "pause",
                })
            }
        }

        let members = self.agents.list_by_team(team_id).await?;
        let mut running: Vec<Uuid> = members
            .iter()
            .filter(|a| a.state == AgentState::Running)
            .map(|a| a.id)
            .collect();
        running.sort();
        for agent_id in running {
            if let Err(e) = self.lifecycle.pause(agent_id).await {
                tracing::warn!(%agent_id, "pause during team pause failed: {e}");
            }
        }

        team.status = TeamStatus::Paused;
        self.teams.update(&team).await?;
        self.emit(team_id, EventPayload::TeamPaused { reason: reason.to_string() }).await;
        Ok(())
    }

    /// Resume a paused team; paused members return to idle and are
    /// re-dispatched by the aggregation loop.
    pub async fn resume_team(&self, team_id: Uuid) -> CoreResult<()> {
        let lock = self.lock_for(team_id);
        let _guard = lock.lock().await;

        let mut team = self.load(team_id).await?;
        match team.status {
            TeamStatus::Running => return Ok(()),
            TeamStatus::Paused => {}
            _ => {
                return Err(CoreError::InvalidState {
                    entity: "team",
                    id: team_id.to_string(),
                    state: team.status.to_string(),
                    operation: "resume",
                })
            }
        }

        let members = self.agents.list_by_team(team_id).await?;
        let mut paused: Vec<Uuid> = members
            .iter()
            .filter(|a| a.state == AgentState::Paused)
            .map(|a| a.id)
            .collect();
        paused.sort();
        for agent_id in paused {
            if let Err(e) = self.lifecycle.resume(agent_id).await {
                tracing::warn!(%agent_id, "resume during team resume failed: {e}");
            }
        }

        team.status = TeamStatus::Running;
        self.teams.update(&team).await?;
        self.emit(team_id, EventPayload::TeamResumed {}).await;
        Ok(())
    }

    /// Destroy a team: kill every member and mark the team failed.
    /// Destroying a terminal team is a no-op.
    pub async fn destroy(&self, team_id: Uuid) -> CoreResult<()> {
        let lock = self.lock_for(team_id);
        let _guard = lock.lock().await;

        let mut team = self.load(team_id).await?;
        if team.status.is_terminal() {
            return Ok(());
        }

        let members = self.agents.list_by_team(team_id).await?;
        let ids: Vec<Uuid> = members.iter().filter(|a| a.state.is_live()).map(|a| a.id).collect();
        self.lifecycle.kill_many(ids, "team_destroyed").await?;

        team.status = TeamStatus::Failed;
        team.completed_at = Some(chrono::Utc::now());
        self.teams.update(&team).await?;
        self.emit(team_id, EventPayload::TeamFailed { reason: "destroyed".to_string() }).await;
        Ok(())
    }
}

/// Scale-down victim order: idle first, then paused, then the running
/// agents with the least accumulated runtime.
fn select_victims(live: &[&Agent], count: usize) -> Vec<Uuid> {
    let mut ordered: Vec<&&Agent> = live.iter().collect();
    ordered.sort_by_key(|a| {
        let class = match a.state {
            AgentState::Idle => 0u8,
            AgentState::Paused => 1,
            AgentState::Spawning => 2,
            _ => 3,
        };
        (class, a.runtime_ms, a.id)
    });
    ordered.into_iter().take(count).map(|a| a.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Agent;

    #[test]
    fn test_victim_order_prefers_idle_then_paused_then_low_progress() {
        let mut idle = Agent::new("t", "sonnet");
        idle.state = AgentState::Idle;
        let mut paused = Agent::new("t", "sonnet");
        paused.state = AgentState::Paused;
        let mut fresh_runner = Agent::new("t", "sonnet");
        fresh_runner.state = AgentState::Running;
        fresh_runner.runtime_ms = 10;
        let mut old_runner = Agent::new("t", "sonnet");
        old_runner.state = AgentState::Running;
        old_runner.runtime_ms = 60_000;

        let live = vec![&old_runner, &fresh_runner, &paused, &idle];
        let victims = select_victims(&live, 3);
        assert_eq!(victims[0], idle.id);
        assert_eq!(victims[1], paused.id);
        assert_eq!(victims[2], fresh_runner.id);
    }
}
