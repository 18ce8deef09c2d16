//! Shared test harness: the full core graph over the in-memory store and
//! the scriptable mock runtime, with fast retry timings.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use drover::adapters::memory::{
    InMemoryAgentRepository, InMemoryBudgetRepository, InMemoryEventRepository,
    InMemoryTeamRepository,
};
use drover::adapters::runtime::MockRuntime;
use drover::domain::models::config::{BudgetConfig, OrchestratorConfig};
use drover::domain::ports::{EventQuery, EventRepository};
use drover::services::{
    BudgetController, EventBus, EventBusConfig, LifecycleConfig, LifecycleManager, RetryPolicy,
    TeamOrchestrator,
};

pub struct TestGraph {
    pub bus: Arc<EventBus>,
    pub runtime: Arc<MockRuntime>,
    pub agents: Arc<InMemoryAgentRepository>,
    pub teams: Arc<InMemoryTeamRepository>,
    pub events: Arc<InMemoryEventRepository>,
    pub budget: Arc<BudgetController>,
    pub lifecycle: Arc<LifecycleManager>,
    pub orchestrator: Arc<TeamOrchestrator>,
}

pub async fn graph() -> TestGraph {
    graph_with(20).await
}

pub async fn graph_with(max_concurrent_agents: usize) -> TestGraph {
    let events = Arc::new(InMemoryEventRepository::new());
    let agents = Arc::new(InMemoryAgentRepository::with_events(events.clone()));
    let teams = Arc::new(InMemoryTeamRepository::new());
    let budgets = Arc::new(InMemoryBudgetRepository::new());
    let runtime = Arc::new(MockRuntime::new());

    let bus = Arc::new(
        EventBus::new(EventBusConfig::default())
            .with_store(events.clone() as Arc<dyn EventRepository>),
    );
    let budget =
        Arc::new(BudgetController::new(budgets, bus.clone(), BudgetConfig::default()));

    let lifecycle = LifecycleManager::new(
        agents.clone(),
        runtime.clone(),
        bus.clone(),
        budget.clone(),
        LifecycleConfig {
            max_concurrent_agents,
            retry: RetryPolicy { max_retries: 3, base_ms: 10, cap_ms: 100, jitter: 0.25 },
            reaper_interval: Duration::from_millis(10),
            ..Default::default()
        },
    );

    let orchestrator = TeamOrchestrator::new(
        teams.clone(),
        agents.clone(),
        lifecycle.clone(),
        budget.clone(),
        bus.clone(),
        OrchestratorConfig::default(),
    );

    lifecycle.start().await;
    orchestrator.start().await;

    TestGraph { bus, runtime, agents, teams, events, budget, lifecycle, orchestrator }
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Count persisted events of one kind, optionally for one agent.
pub async fn count_events(
    events: &Arc<InMemoryEventRepository>,
    kind: &str,
    agent_id: Option<uuid::Uuid>,
) -> usize {
    events
        .query(EventQuery { kind: Some(kind.to_string()), agent_id, ..Default::default() })
        .await
        .unwrap()
        .len()
}
