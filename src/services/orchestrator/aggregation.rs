//! Bus-driven aggregation: dispatch, completion derivation, failure
//! budget, and budget-ladder reactions.
//!
//! The orchestrator subscribes to member lifecycle events instead of
//! polling. Dispatch decisions and the terminal derivation run under the
//! team lock; team-wide reactions (pause, fail) re-acquire it through the
//! public operations so locking stays single-order: team lock, then agent
//! locks.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::{
    Agent, AgentState, BudgetScope, BudgetWindow, Event, EventPayload, TeamStatus, TeamStrategy,
};
use crate::services::event_bus::EventSubscriber;

use super::TeamOrchestrator;

/// Team-wide reaction decided under the lock, applied after release.
enum Reaction {
    None,
    /// The strategy spawned a successor; skip the completion derivation
    /// until the new member lands in the store's view.
    Advanced,
    Degrade { failed_count: u32 },
    Fail { reason: &'static str },
}

impl TeamOrchestrator {
    pub(super) async fn run_aggregation(self: Arc<Self>, mut subscriber: EventSubscriber) {
        while let Some(event) = subscriber.recv().await {
            if let Err(e) = self.handle_event(&event).await {
                tracing::warn!(kind = event.kind(), "aggregation handler error: {e}");
            }
        }
    }

    async fn handle_event(&self, event: &Event) -> CoreResult<()> {
        match &event.payload {
            EventPayload::BudgetThrottle { scope, .. } => {
                self.on_budget_throttle(scope).await;
                return Ok(());
            }
            EventPayload::BudgetExhausted { scope } => {
                self.on_budget_exhausted(scope).await;
                return Ok(());
            }
            _ => {}
        }

        let (Some(team_id), Some(agent_id)) = (event.team_id, event.agent_id) else {
            return Ok(());
        };

        match &event.payload {
            EventPayload::AgentReady { .. } | EventPayload::AgentResumed {} => {
                self.dispatch_member(team_id, agent_id).await
            }
            EventPayload::AgentCompleted { .. } => {
                let output = event
                    .extra
                    .get("output")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.on_member_terminal(team_id, agent_id, Some(output)).await
            }
            EventPayload::AgentFailed { .. } | EventPayload::AgentKilled { .. } => {
                self.on_member_terminal(team_id, agent_id, None).await
            }
            _ => Ok(()),
        }
    }

    /// Hand a ready member its work, per the team's strategy.
    async fn dispatch_member(&self, team_id: Uuid, agent_id: Uuid) -> CoreResult<()> {
        let lock = self.lock_for(team_id);
        let _guard = lock.lock().await;

        let Ok(team) = self.load(team_id).await else { return Ok(()) };
        if team.status != TeamStatus::Running {
            return Ok(());
        }

        let message = match team.config.strategy {
            TeamStrategy::Parallel | TeamStrategy::Tree => team.task.clone(),
            TeamStrategy::Pipeline => team
                .shared_context
                .get("stage_input")
                .cloned()
                .unwrap_or_else(|| team.task.clone()),
            TeamStrategy::MapReduce => {
                let is_reducer =
                    team.shared_context.get("reducer_id").map(String::as_str)
                        == Some(agent_id.to_string().as_str());
                if is_reducer {
                    let mut outputs: Vec<(&String, &String)> = team
                        .shared_context
                        .iter()
                        .filter(|(k, _)| k.starts_with("output:"))
                        .collect();
                    outputs.sort_by_key(|(k, _)| (*k).clone());
                    let mut message = format!("{}\n\nReduce these mapper results:\n", team.task);
                    for (_, output) in outputs {
                        message.push_str("---\n");
                        message.push_str(output);
                        message.push('\n');
                    }
                    message
                } else {
                    team.task.clone()
                }
            }
        };

        drop(_guard);
        if let Err(e) = self.lifecycle.send(agent_id, message).await {
            tracing::warn!(%agent_id, "dispatch failed: {e}");
        }
        Ok(())
    }

    /// Fold one terminal member into the team: record output, advance the
    /// strategy, check the failure budget, derive team completion.
    async fn on_member_terminal(
        &self,
        team_id: Uuid,
        agent_id: Uuid,
        output: Option<String>,
    ) -> CoreResult<()> {
        let lock = self.lock_for(team_id);
        let guard = lock.lock().await;

        let Ok(mut team) = self.load(team_id).await else { return Ok(()) };
        if team.status.is_terminal() {
            return Ok(());
        }

        if let Some(output) = output {
            team.shared_context.insert(format!("output:{agent_id}"), output);
        }

        let members = self.agents.list_by_team(team_id).await?;
        let member = members.iter().find(|a| a.id == agent_id);
        let reaction = self.advance_strategy(&mut team, &members, member).await?;

        // Point-in-time metric refresh while we hold the lock.
        team.metrics.budget_consumed = self
            .budget
            .get(&BudgetScope::Team(team_id), BudgetWindow::Lifetime)
            .await?
            .map_or(0.0, |r| r.cost_usd);
        team.metrics.counts = members
            .iter()
            .fold(std::collections::HashMap::new(), |mut counts, a| {
                *counts.entry(a.state.as_str().to_string()).or_default() += 1;
                counts
            });

        let reaction = match reaction {
            Reaction::None => self.derive_completion(&mut team, &members).await?,
            other => other,
        };
        self.teams.update(&team).await?;
        drop(guard);

        match reaction {
            Reaction::None | Reaction::Advanced => {}
            Reaction::Degrade { failed_count } => {
                self.emit(
                    team_id,
                    EventPayload::TeamDegraded {
                        failed_count,
                        failure_budget: team.config.failure_budget,
                    },
                )
                .await;
                let _ = self.pause_team(team_id, "failure_budget").await;
            }
            Reaction::Fail { reason } => {
                self.fail_team(team_id, reason).await;
            }
        }
        Ok(())
    }

    /// Strategy bookkeeping after a member lands: pipeline advance,
    /// reducer spawn, failure budget.
    async fn advance_strategy(
        &self,
        team: &mut crate::domain::models::Team,
        members: &[Agent],
        member: Option<&Agent>,
    ) -> CoreResult<Reaction> {
        let failed_count =
            members.iter().filter(|a| a.state == AgentState::Failed).count() as u32;

        match team.config.strategy {
            TeamStrategy::Pipeline => {
                if let Some(member) = member {
                    match member.state {
                        AgentState::Failed => return Ok(Reaction::Fail { reason: "stage_failed" }),
                        AgentState::Completed => {
                            let completed =
                                members.iter().filter(|a| a.state == AgentState::Completed).count();
                            if completed < team.config.desired_size {
                                let output = team
                                    .shared_context
                                    .get(&format!("output:{}", member.id))
                                    .cloned()
                                    .unwrap_or_default();
                                team.shared_context.insert("stage_input".to_string(), output);
                                let next = self.spawn_member(team, completed).await?;
                                team.agent_ids.push(next);
                                return Ok(Reaction::Advanced);
                            }
                        }
                        _ => {}
                    }
                }
            }
            TeamStrategy::MapReduce => {
                let reducer_spawned = team.shared_context.contains_key("reducer_id");
                let mappers_done = members
                    .iter()
                    .filter(|a| {
                        team.shared_context.get("reducer_id").map(String::as_str)
                            != Some(a.id.to_string().as_str())
                    })
                    .all(|a| a.state.is_terminal());
                if failed_count > team.config.failure_budget {
                    return Ok(Reaction::Degrade { failed_count });
                }
                if !reducer_spawned && mappers_done {
                    let reducer = self.spawn_member(team, team.agent_ids.len()).await?;
                    team.shared_context.insert("reducer_id".to_string(), reducer.to_string());
                    team.agent_ids.push(reducer);
                    return Ok(Reaction::Advanced);
                }
            }
            TeamStrategy::Parallel | TeamStrategy::Tree => {
                if failed_count > team.config.failure_budget {
                    return Ok(Reaction::Degrade { failed_count });
                }
            }
        }
        Ok(Reaction::None)
    }

    /// A team is terminal iff all its members are. The derived status is
    /// written while the team lock is held by the caller.
    async fn derive_completion(
        &self,
        team: &mut crate::domain::models::Team,
        members: &[Agent],
    ) -> CoreResult<Reaction> {
        if members.is_empty() || members.iter().any(|a| a.state.is_live()) {
            return Ok(Reaction::None);
        }
        // Map/reduce teams wait for the reducer to exist before deriving.
        if team.config.strategy == TeamStrategy::MapReduce
            && !team.shared_context.contains_key("reducer_id")
        {
            return Ok(Reaction::None);
        }

        let completed = members.iter().filter(|a| a.state == AgentState::Completed).count();
        let failed = members.iter().filter(|a| a.state == AgentState::Failed).count() as u32;

        // Strategy-specific success criteria: a pipeline must finish every
        // stage, a map/reduce team must land its reducer.
        let strategy_satisfied = match team.config.strategy {
            TeamStrategy::Pipeline => completed == team.config.desired_size,
            TeamStrategy::MapReduce => team
                .shared_context
                .get("reducer_id")
                .and_then(|id| Uuid::parse_str(id).ok())
                .and_then(|id| members.iter().find(|a| a.id == id))
                .is_some_and(|reducer| reducer.state == AgentState::Completed),
            TeamStrategy::Parallel | TeamStrategy::Tree => true,
        };

        if strategy_satisfied && completed > 0 && failed <= team.config.failure_budget {
            team.status = TeamStatus::Completed;
            team.completed_at = Some(chrono::Utc::now());
            self.emit(
                team.id,
                EventPayload::TeamCompleted { budget_consumed: team.metrics.budget_consumed },
            )
            .await;
            Ok(Reaction::None)
        } else {
            Ok(Reaction::Fail { reason: "all_members_terminal_without_success" })
        }
    }

    /// Kill a team's remaining members and mark it failed.
    pub(super) async fn fail_team(&self, team_id: Uuid, reason: &str) {
        let lock = self.lock_for(team_id);
        let _guard = lock.lock().await;

        let Ok(mut team) = self.load(team_id).await else { return };
        if team.status.is_terminal() {
            return;
        }
        if let Ok(members) = self.agents.list_by_team(team_id).await {
            let ids: Vec<Uuid> =
                members.iter().filter(|a| a.state.is_live()).map(|a| a.id).collect();
            if let Err(e) = self.lifecycle.kill_many(ids, reason).await {
                tracing::warn!(%team_id, "kill during team failure: {e}");
            }
        }
        team.status = TeamStatus::Failed;
        team.completed_at = Some(chrono::Utc::now());
        if let Err(e) = self.teams.update(&team).await {
            tracing::error!(%team_id, "failed to persist team failure: {e}");
        }
        drop(_guard);
        self.emit(team_id, EventPayload::TeamFailed { reason: reason.to_string() }).await;
    }

    /// Throttle threshold crossed: pause the affected teams.
    async fn on_budget_throttle(&self, scope: &str) {
        if let Some(team_id) = parse_team_scope(scope) {
            let _ = self.pause_team(team_id, "budget_throttle").await;
        } else if scope.starts_with("global") {
            if let Ok(teams) = self
                .teams
                .list(crate::domain::ports::TeamFilter {
                    status: Some(TeamStatus::Running),
                    ..Default::default()
                })
                .await
            {
                for team in teams {
                    let _ = self.pause_team(team.id, "budget_throttle").await;
                }
            }
        }
    }

    /// Hard threshold hit: the scope's work stops.
    async fn on_budget_exhausted(&self, scope: &str) {
        if let Some(team_id) = parse_team_scope(scope) {
            self.fail_team(team_id, "budget_exhausted").await;
        } else if scope.starts_with("global") {
            if let Ok(teams) = self
                .teams
                .list(crate::domain::ports::TeamFilter {
                    status: Some(TeamStatus::Running),
                    ..Default::default()
                })
                .await
            {
                for team in teams {
                    self.fail_team(team.id, "budget_exhausted").await;
                }
            }
        }
    }
}

fn parse_team_scope(scope: &str) -> Option<Uuid> {
    scope.strip_prefix("team:").and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_team_scope() {
        let id = Uuid::new_v4();
        assert_eq!(parse_team_scope(&format!("team:{id}")), Some(id));
        assert_eq!(parse_team_scope("global:global"), None);
        assert_eq!(parse_team_scope("team:not-a-uuid"), None);
    }
}
