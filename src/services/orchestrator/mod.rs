//! Team orchestrator - converts a team specification into a running
//! cohort of agents and supervises it to a terminal state.
//!
//! The orchestrator is a thin coordinator over focused subsystems:
//!
//! - **control**: pause/resume/destroy/scale under the team lock
//! - **aggregation**: bus-driven dispatch, completion derivation, failure
//!   budget, budget-ladder reactions
//! - **autoscale**: sampled scaling loop for parallel teams
//!
//! Team status is derived, never commanded: a team is terminal iff all of
//! its members are terminal, and that derivation happens atomically under
//! the team's lock.

mod aggregation;
mod autoscale;
mod control;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::OrchestratorConfig;
use crate::domain::models::{
    AgentState, BudgetScope, BudgetWindow, Event, EventPayload, Team, TeamConfig, TeamStatus,
    TeamStrategy,
};
use crate::domain::ports::{AgentRepository, TeamFilter, TeamRepository};
use crate::services::budget::BudgetController;
use crate::services::event_bus::EventBus;
use crate::services::lifecycle::{LifecycleManager, SpawnOptions};

pub use control::ScaleRequest;

const SOURCE: &str = "orchestrator";

/// Input to `create_team`.
#[derive(Debug, Clone)]
pub struct TeamSpec {
    pub name: String,
    pub task: String,
    pub size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub budget: f64,
    pub strategy: TeamStrategy,
    pub failure_budget: u32,
    pub autoscale: bool,
    pub allow_subagents: bool,
    pub model: Option<String>,
    pub context: HashMap<String, String>,
}

impl Default for TeamSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            task: String::new(),
            size: 3,
            min_size: 1,
            max_size: 10,
            budget: 1.0,
            strategy: TeamStrategy::Parallel,
            failure_budget: 2,
            autoscale: false,
            allow_subagents: true,
            model: None,
            context: HashMap::new(),
        }
    }
}

/// Point-in-time view of a team for operators.
#[derive(Debug, Clone)]
pub struct TeamStatusReport {
    pub team: Team,
    pub counts: HashMap<AgentState, usize>,
    pub budget_consumed: f64,
    pub budget_remaining: f64,
}

/// The team orchestrator.
pub struct TeamOrchestrator {
    /// Self-handle for launching the aggregation and autoscaler tasks.
    me: Weak<TeamOrchestrator>,
    pub(super) teams: Arc<dyn TeamRepository>,
    pub(super) agents: Arc<dyn AgentRepository>,
    pub(super) lifecycle: Arc<LifecycleManager>,
    pub(super) budget: Arc<BudgetController>,
    pub(super) bus: Arc<EventBus>,
    pub(super) config: OrchestratorConfig,
    started: AtomicBool,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    pub(super) last_scaled: std::sync::Mutex<HashMap<Uuid, Instant>>,
    pub(super) idle_since: std::sync::Mutex<HashMap<Uuid, Instant>>,
}

impl TeamOrchestrator {
    pub fn new(
        teams: Arc<dyn TeamRepository>,
        agents: Arc<dyn AgentRepository>,
        lifecycle: Arc<LifecycleManager>,
        budget: Arc<BudgetController>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            teams,
            agents,
            lifecycle,
            budget,
            bus,
            config,
            started: AtomicBool::new(false),
            locks: std::sync::Mutex::new(HashMap::new()),
            last_scaled: std::sync::Mutex::new(HashMap::new()),
            idle_since: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    /// Start the aggregation subscription and the autoscaler.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(orchestrator) = self.strong() else { return };
        let subscriber = self
            .bus
            .subscribe(
                "orchestrator",
                crate::domain::models::EventFilter::for_kinds([
                    "agent_ready",
                    "agent_resumed",
                    "agent_completed",
                    "agent_failed",
                    "agent_killed",
                    "budget_throttle",
                    "budget_exhausted",
                ]),
            )
            .await;
        tokio::spawn(async move { orchestrator.run_aggregation(subscriber).await });

        if let Some(orchestrator) = self.strong() {
            tokio::spawn(async move { orchestrator.run_autoscaler().await });
        }
        tracing::info!("team orchestrator started");
    }

    /// Create and launch a team.
    ///
    /// Persists the team, reserves its budget, spawns the initial cohort
    /// per strategy, and emits `team_created`.
    pub async fn create_team(&self, spec: TeamSpec) -> CoreResult<Uuid> {
        if spec.name.is_empty() {
            return Err(CoreError::InvalidInput("team name cannot be empty".into()));
        }
        if spec.size == 0 {
            return Err(CoreError::InvalidInput("team size must be at least 1".into()));
        }
        if spec.budget <= 0.0 {
            return Err(CoreError::InvalidInput("team budget must be positive".into()));
        }
        if spec.min_size > spec.size || spec.size > spec.max_size {
            return Err(CoreError::InvalidInput(format!(
                "size {} outside [{}, {}]",
                spec.size, spec.min_size, spec.max_size
            )));
        }

        // Debit the full allocation from the parent scope before anything
        // is persisted; a denied reservation leaves no trace.
        self.budget
            .reserve(&BudgetScope::Global, BudgetWindow::Lifetime, spec.budget)
            .await?;

        let config = TeamConfig {
            desired_size: spec.size,
            min_size: spec.min_size,
            max_size: spec.max_size,
            budget_allocated: spec.budget,
            strategy: spec.strategy,
            failure_budget: spec.failure_budget,
            autoscale: spec.autoscale && spec.strategy == TeamStrategy::Parallel,
            allow_subagents: spec.allow_subagents,
        };
        let mut team = Team::new(spec.name.clone(), spec.task.clone(), config);
        team.shared_context = spec.context;
        if let Some(model) = &spec.model {
            team.shared_context.insert("model".to_string(), model.clone());
        }
        self.teams.create(&team).await?;
        self.budget
            .set_limit(&BudgetScope::Team(team.id), BudgetWindow::Lifetime, spec.budget)
            .await?;

        self.bus
            .publish(
                Event::new(
                    SOURCE,
                    EventPayload::TeamCreated {
                        name: spec.name,
                        size: spec.size,
                        strategy: spec.strategy.as_str().to_string(),
                    },
                )
                .for_team(team.id),
            )
            .await;

        // Mark the team running before the first member's session can
        // come up; dispatch only serves members of running teams.
        team.status = TeamStatus::Running;
        self.teams.update(&team).await?;
        self.bus
            .publish(Event::new(SOURCE, EventPayload::TeamRunning {}).for_team(team.id))
            .await;

        let initial = match spec.strategy {
            TeamStrategy::Parallel | TeamStrategy::MapReduce => team.config.desired_size,
            TeamStrategy::Pipeline | TeamStrategy::Tree => 1,
        };
        for index in 0..initial {
            let agent_id = self.spawn_member(&team, index).await?;
            team.agent_ids.push(agent_id);
        }
        self.teams.update(&team).await?;

        Ok(team.id)
    }

    /// Non-blocking status read: persisted team plus live member counts.
    pub async fn status(&self, team_id: Uuid) -> CoreResult<TeamStatusReport> {
        let team = self.load(team_id).await?;
        let members = self.agents.list_by_team(team_id).await?;
        let mut counts: HashMap<AgentState, usize> = HashMap::new();
        for member in &members {
            *counts.entry(member.state).or_default() += 1;
        }
        let consumed = self
            .budget
            .get(&BudgetScope::Team(team_id), BudgetWindow::Lifetime)
            .await?
            .map_or(0.0, |r| r.cost_usd);
        let remaining = (team.config.budget_allocated - consumed).max(0.0);
        Ok(TeamStatusReport { team, counts, budget_consumed: consumed, budget_remaining: remaining })
    }

    pub async fn list(&self, filter: TeamFilter) -> CoreResult<Vec<Team>> {
        self.teams.list(filter).await
    }

    pub async fn get(&self, team_id: Uuid) -> CoreResult<Team> {
        self.load(team_id).await
    }

    // -------------------------------------------------------------------
    // Shared internals
    // -------------------------------------------------------------------

    pub(super) fn lock_for(&self, team_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(team_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub(super) async fn load(&self, team_id: Uuid) -> CoreResult<Team> {
        self.teams
            .get(team_id)
            .await?
            .ok_or_else(|| CoreError::team_not_found(team_id))
    }

    /// Spawn one member with the team's per-agent budget slice.
    pub(super) async fn spawn_member(&self, team: &Team, index: usize) -> CoreResult<Uuid> {
        let context: Vec<(String, String)> = team
            .shared_context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.lifecycle
            .spawn(
                team.task.clone(),
                SpawnOptions {
                    label: Some(format!("{}-{}", team.name, index)),
                    model: team.shared_context.get("model").cloned(),
                    team_id: Some(team.id),
                    budget_limit: Some(team.config.per_agent_budget()),
                    context,
                    ..Default::default()
                },
            )
            .await
    }

    pub(super) async fn emit(&self, team_id: Uuid, payload: EventPayload) {
        self.bus.publish(Event::new(SOURCE, payload).for_team(team_id)).await;
    }
}
