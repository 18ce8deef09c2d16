//! Auto-improvement loop integration tests.

mod common;

use std::time::Duration;

use common::{count_events, graph, wait_until};
use drover::adapters::runtime::MockFailure;
use drover::domain::models::config::ImprovementConfig;
use drover::domain::models::{BudgetScope, BudgetWindow, TeamStatus};
use drover::domain::ports::TeamFilter;
use drover::services::{ImprovementLoop, SpawnOptions};

fn improvement_config() -> ImprovementConfig {
    ImprovementConfig {
        enabled: true,
        interval_secs: 3_600,
        cycle_cost_cap: 0.25,
        daily_cost_cap: 0.60,
        scope_allowlist: vec!["src/**".to_string()],
        failed_fraction_threshold: 0.25,
        bus_drop_threshold: 1_000_000,
        burn_rate_threshold: 1.0,
    }
}

#[tokio::test]
async fn test_healthy_system_spawns_nothing() {
    let g = graph().await;
    let improvement = ImprovementLoop::new(
        g.orchestrator.clone(),
        g.agents.clone(),
        g.budget.clone(),
        g.bus.clone(),
        improvement_config(),
    );

    let summary = improvement.run_cycle().await.unwrap();
    assert_eq!(summary.checks.len(), 3);
    assert_eq!(summary.teams_spawned, 0);
    assert_eq!(count_events(&g.events, "auto_improvement_cycle", None).await, 1);
}

#[tokio::test]
async fn test_failed_agents_trigger_a_bounded_team() {
    let g = graph().await;
    // Manufacture a 100% failure rate.
    g.runtime.fail_next_spawn(MockFailure::Fatal("bad".into())).await;
    let agent_id = g
        .lifecycle
        .spawn("will fail", SpawnOptions { max_retries: Some(0), ..Default::default() })
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        g.lifecycle.get(agent_id).await.unwrap().state
            == drover::domain::models::AgentState::Failed
    })
    .await;

    let improvement = ImprovementLoop::new(
        g.orchestrator.clone(),
        g.agents.clone(),
        g.budget.clone(),
        g.bus.clone(),
        improvement_config(),
    );
    let summary = improvement.run_cycle().await.unwrap();
    assert_eq!(summary.teams_spawned, 1);

    // The spawned team is a single tightly budgeted agent with
    // sub-spawning disabled.
    let teams = g.orchestrator.list(TeamFilter::default()).await.unwrap();
    let team = teams
        .iter()
        .find(|t| t.name.starts_with("improve-"))
        .expect("an improvement team should exist");
    assert_eq!(team.config.desired_size, 1);
    assert!(!team.config.allow_subagents);
    assert!(team.config.budget_allocated <= 0.25 + 1e-9);

    // The dedicated ceiling was debited.
    let project = g
        .budget
        .get(&BudgetScope::Project("improvement".to_string()), BudgetWindow::Day)
        .await
        .unwrap()
        .unwrap();
    assert!((project.cost_usd - 0.25).abs() < 1e-9);

    // Let the repair team finish so it does not leak into other checks.
    wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team.id).await.unwrap().status.is_terminal()
    })
    .await;
}

#[tokio::test]
async fn test_daily_ceiling_skips_units_when_spent() {
    let g = graph().await;
    g.runtime.fail_next_spawn(MockFailure::Fatal("bad".into())).await;
    let agent_id = g
        .lifecycle
        .spawn("will fail", SpawnOptions { max_retries: Some(0), ..Default::default() })
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        g.lifecycle.get(agent_id).await.unwrap().state
            == drover::domain::models::AgentState::Failed
    })
    .await;

    let mut config = improvement_config();
    config.daily_cost_cap = 0.30;
    let improvement = ImprovementLoop::new(
        g.orchestrator.clone(),
        g.agents.clone(),
        g.budget.clone(),
        g.bus.clone(),
        config,
    );

    // First cycle reserves 0.25 of the 0.30 ceiling.
    let first = improvement.run_cycle().await.unwrap();
    assert_eq!(first.teams_spawned, 1);
    // Second cycle cannot reserve another 0.25.
    let second = improvement.run_cycle().await.unwrap();
    assert_eq!(second.teams_spawned, 0);

    // Both cycles were recorded.
    assert_eq!(count_events(&g.events, "auto_improvement_cycle", None).await, 2);
}

#[tokio::test]
async fn test_improvement_team_completes_like_any_other() {
    let g = graph().await;
    g.runtime.fail_next_spawn(MockFailure::Fatal("bad".into())).await;
    let agent_id = g
        .lifecycle
        .spawn("will fail", SpawnOptions { max_retries: Some(0), ..Default::default() })
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        g.lifecycle.get(agent_id).await.unwrap().state
            == drover::domain::models::AgentState::Failed
    })
    .await;

    let improvement = ImprovementLoop::new(
        g.orchestrator.clone(),
        g.agents.clone(),
        g.budget.clone(),
        g.bus.clone(),
        improvement_config(),
    );
    improvement.run_cycle().await.unwrap();

    let teams = g.orchestrator.list(TeamFilter::default()).await.unwrap();
    let team_id = teams.iter().find(|t| t.name.starts_with("improve-")).unwrap().id;
    let completed = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status == TeamStatus::Completed
    })
    .await;
    assert!(completed, "the repair agent runs to completion on the mock runtime");
}
