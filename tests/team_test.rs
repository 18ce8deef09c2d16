//! Team orchestrator integration tests: the end-to-end scenarios over
//! the in-memory store and the mock runtime.

mod common;

use std::time::Duration;

use common::{count_events, graph, wait_until};
use drover::adapters::runtime::MockSendResult;
use drover::domain::models::{AgentState, BudgetScope, BudgetWindow, TeamStatus, TeamStrategy};
use drover::domain::ports::{AgentRepository, EventQuery, EventRepository};
use drover::services::orchestrator::{ScaleRequest, TeamSpec};
use drover::services::pricing;

fn spec(name: &str, size: usize, budget: f64, strategy: TeamStrategy) -> TeamSpec {
    TeamSpec {
        name: name.to_string(),
        task: "echo hello".to_string(),
        size,
        min_size: 1,
        max_size: 10,
        budget,
        strategy,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_parallel_team_happy_path() {
    let g = graph().await;
    let team_id = g
        .orchestrator
        .create_team(spec("demo", 3, 1.0, TeamStrategy::Parallel))
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status == TeamStatus::Completed
    })
    .await;
    assert!(completed, "team should run to completion");

    // Every member walked spawning -> idle -> running -> completed.
    let members = g.agents.list_by_team(team_id).await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|a| a.state == AgentState::Completed));

    let team_events = g
        .events
        .query(EventQuery { team_id: Some(team_id), ..Default::default() })
        .await
        .unwrap();
    let completed_events =
        team_events.iter().filter(|e| e.kind() == "agent_completed").count();
    let team_completed = team_events.iter().filter(|e| e.kind() == "team_completed").count();
    assert_eq!(completed_events, 3, "exactly one completion per member");
    assert_eq!(team_completed, 1);

    // Budget consumed is exactly three default mock sends.
    let per_send = pricing::estimate_cost("sonnet", 10, 20);
    let report = g.orchestrator.status(team_id).await.unwrap();
    assert!((report.budget_consumed - 3.0 * per_send).abs() < 1e-9);
    assert!(report.budget_consumed <= 1.0);
}

#[tokio::test]
async fn test_create_team_validates_input() {
    let g = graph().await;
    assert!(g
        .orchestrator
        .create_team(spec("", 3, 1.0, TeamStrategy::Parallel))
        .await
        .is_err());
    assert!(g
        .orchestrator
        .create_team(spec("zero", 0, 1.0, TeamStrategy::Parallel))
        .await
        .is_err());
    assert!(g
        .orchestrator
        .create_team(spec("free", 3, 0.0, TeamStrategy::Parallel))
        .await
        .is_err());
}

#[tokio::test]
async fn test_budget_exhaustion_kills_team() {
    let g = graph().await;
    // Each send burns $0.0033 on sonnet pricing (1100 input tokens), so
    // the third send lands at 99% of the cap and the fourth would exceed it.
    for _ in 0..5 {
        g.runtime.script_send(MockSendResult::success("ok", 1100, 0)).await;
    }
    let team_id = g
        .orchestrator
        .create_team(spec("strapped", 5, 0.01, TeamStrategy::Parallel))
        .await
        .unwrap();

    let terminal = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status.is_terminal()
    })
    .await;
    assert!(terminal, "team should reach a terminal state");

    let team = g.orchestrator.get(team_id).await.unwrap();
    assert_eq!(team.status, TeamStatus::Failed);

    // The hard cap held: consumed stays at or under the allocation.
    let report = g.orchestrator.status(team_id).await.unwrap();
    assert!(report.budget_consumed <= 0.01 + 1e-9);

    // The ladder fired on the way down.
    assert!(count_events(&g.events, "budget_throttle", None).await >= 1);
    assert!(count_events(&g.events, "budget_exhausted", None).await >= 1);

    // No member survived.
    let members = g.agents.list_by_team(team_id).await.unwrap();
    assert!(members.iter().all(|a| a.state.is_terminal()));
}

#[tokio::test]
async fn test_concurrent_scale_and_destroy() {
    let g = graph().await;
    // Keep members busy so the race has live victims on both sides.
    for _ in 0..20 {
        g.runtime
            .script_send(MockSendResult::default().with_delay(Duration::from_secs(10)))
            .await;
    }
    let team_id = g
        .orchestrator
        .create_team(spec("contended", 10, 5.0, TeamStrategy::Parallel))
        .await
        .unwrap();
    wait_until(Duration::from_secs(3), || async {
        let members = g.agents.list_by_team(team_id).await.unwrap();
        members.len() == 10 && members.iter().all(|a| a.state != AgentState::Spawning)
    })
    .await;

    let scale = g.orchestrator.scale(team_id, ScaleRequest::Target(3));
    let destroy = g.orchestrator.destroy(team_id);
    let (scale_result, destroy_result) = tokio::join!(scale, destroy);
    destroy_result.unwrap();
    // Scale may observe the destroyed team depending on lock order.
    if let Err(e) = scale_result {
        assert!(matches!(e, drover::domain::errors::CoreError::InvalidState { .. }));
    }

    // No dangling member either way.
    let settled = wait_until(Duration::from_secs(3), || async {
        g.agents
            .list_by_team(team_id)
            .await
            .unwrap()
            .iter()
            .all(|a| a.state.is_terminal())
    })
    .await;
    assert!(settled, "no member may stay live after scale+destroy");
    assert_eq!(g.orchestrator.get(team_id).await.unwrap().status, TeamStatus::Failed);

    // Exactly one kill event per killed member, despite the double kill.
    let members = g.agents.list_by_team(team_id).await.unwrap();
    for member in members.iter().filter(|a| a.state == AgentState::Killed) {
        assert_eq!(
            count_events(&g.events, "agent_killed", Some(member.id)).await,
            1,
            "agent {} must have exactly one kill event",
            member.id
        );
    }
}

#[tokio::test]
async fn test_scale_clamps_silently() {
    let g = graph().await;
    for _ in 0..30 {
        g.runtime
            .script_send(MockSendResult::default().with_delay(Duration::from_secs(10)))
            .await;
    }
    let team_id = g
        .orchestrator
        .create_team(TeamSpec {
            name: "clamped".to_string(),
            task: "work".to_string(),
            size: 3,
            min_size: 2,
            max_size: 4,
            budget: 5.0,
            strategy: TeamStrategy::Parallel,
            ..Default::default()
        })
        .await
        .unwrap();
    wait_until(Duration::from_secs(3), || async {
        g.agents.list_by_team(team_id).await.unwrap().len() == 3
    })
    .await;

    // Above max: clamped to 4, not rejected.
    g.orchestrator.scale(team_id, ScaleRequest::Target(50)).await.unwrap();
    let grown = wait_until(Duration::from_secs(3), || async {
        g.agents
            .list_by_team(team_id)
            .await
            .unwrap()
            .iter()
            .filter(|a| a.state.is_live())
            .count()
            == 4
    })
    .await;
    assert!(grown);

    // Below min: clamped to 2.
    g.orchestrator.scale(team_id, ScaleRequest::Target(0)).await.unwrap();
    let shrunk = wait_until(Duration::from_secs(3), || async {
        g.agents
            .list_by_team(team_id)
            .await
            .unwrap()
            .iter()
            .filter(|a| a.state.is_live())
            .count()
            == 2
    })
    .await;
    assert!(shrunk);

    // Both clamps are visible in team_scaled events.
    let scaled = g
        .events
        .query(EventQuery {
            kind: Some("team_scaled".to_string()),
            team_id: Some(team_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(scaled.len(), 2);
}

#[tokio::test]
async fn test_pipeline_chains_outputs() {
    let g = graph().await;
    g.runtime.script_send(MockSendResult::success("stage-one-out", 10, 10)).await;
    g.runtime.script_send(MockSendResult::success("stage-two-out", 10, 10)).await;
    g.runtime.script_send(MockSendResult::success("stage-three-out", 10, 10)).await;

    let team_id = g
        .orchestrator
        .create_team(TeamSpec {
            name: "assembly".to_string(),
            task: "start here".to_string(),
            size: 3,
            min_size: 1,
            max_size: 3,
            budget: 1.0,
            strategy: TeamStrategy::Pipeline,
            ..Default::default()
        })
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status == TeamStatus::Completed
    })
    .await;
    assert!(completed, "pipeline should finish all stages");

    let messages = g.runtime.sent_messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0], "start here");
    assert_eq!(messages[1], "stage-one-out");
    assert_eq!(messages[2], "stage-two-out");
}

#[tokio::test]
async fn test_pipeline_stage_failure_fails_team() {
    let g = graph().await;
    g.runtime.script_send(MockSendResult::fatal("stage exploded")).await;
    let team_id = g
        .orchestrator
        .create_team(TeamSpec {
            name: "doomed-line".to_string(),
            task: "start".to_string(),
            size: 3,
            min_size: 1,
            max_size: 3,
            budget: 1.0,
            strategy: TeamStrategy::Pipeline,
            failure_budget: 5,
            ..Default::default()
        })
        .await
        .unwrap();

    let failed = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status == TeamStatus::Failed
    })
    .await;
    assert!(failed, "first fatal stage failure must fail a pipeline team");
}

#[tokio::test]
async fn test_map_reduce_spawns_reducer_after_mappers() {
    let g = graph().await;
    g.runtime.script_send(MockSendResult::success("mapped-a", 10, 10)).await;
    g.runtime.script_send(MockSendResult::success("mapped-b", 10, 10)).await;
    g.runtime.script_send(MockSendResult::success("reduced", 10, 10)).await;

    let team_id = g
        .orchestrator
        .create_team(TeamSpec {
            name: "mr".to_string(),
            task: "count words".to_string(),
            size: 2,
            min_size: 1,
            max_size: 3,
            budget: 1.0,
            strategy: TeamStrategy::MapReduce,
            ..Default::default()
        })
        .await
        .unwrap();

    let completed = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status == TeamStatus::Completed
    })
    .await;
    assert!(completed);

    // Two mappers plus one reducer.
    let members = g.agents.list_by_team(team_id).await.unwrap();
    assert_eq!(members.len(), 3);

    // The reducer's message carried both mapper outputs.
    let messages = g.runtime.sent_messages().await;
    let reducer_message = messages.last().unwrap();
    assert!(reducer_message.contains("mapped-a"));
    assert!(reducer_message.contains("mapped-b"));
}

#[tokio::test]
async fn test_failure_budget_degrades_team() {
    let g = graph().await;
    g.runtime.script_send(MockSendResult::fatal("boom 1")).await;
    g.runtime.script_send(MockSendResult::fatal("boom 2")).await;

    let team_id = g
        .orchestrator
        .create_team(TeamSpec {
            name: "fragile".to_string(),
            task: "risky".to_string(),
            size: 4,
            min_size: 1,
            max_size: 4,
            budget: 1.0,
            strategy: TeamStrategy::Parallel,
            failure_budget: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    let degraded = wait_until(Duration::from_secs(5), || async {
        count_events(&g.events, "team_degraded", None).await >= 1
    })
    .await;
    assert!(degraded, "crossing the failure budget must publish team_degraded");

    let paused = wait_until(Duration::from_secs(5), || async {
        g.orchestrator.get(team_id).await.unwrap().status == TeamStatus::Paused
    })
    .await;
    assert!(paused, "the degraded team awaits operator intervention");
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let g = graph().await;
    let team_id = g
        .orchestrator
        .create_team(spec("short", 2, 1.0, TeamStrategy::Parallel))
        .await
        .unwrap();
    g.orchestrator.destroy(team_id).await.unwrap();
    g.orchestrator.destroy(team_id).await.unwrap();

    let team_failed_events = g
        .events
        .query(EventQuery {
            kind: Some("team_failed".to_string()),
            team_id: Some(team_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(team_failed_events.len(), 1);
}

#[tokio::test]
async fn test_create_team_debits_global_reservation() {
    let g = graph().await;
    g.orchestrator
        .create_team(spec("reserved", 2, 0.5, TeamStrategy::Parallel))
        .await
        .unwrap();

    // The allocation is debited from the parent scope up front, so a
    // second creation sees a smaller global remainder.
    let global = g
        .budget
        .get(&BudgetScope::Global, BudgetWindow::Lifetime)
        .await
        .unwrap()
        .unwrap();
    assert!(global.cost_usd >= 0.5 - 1e-9);
}

#[tokio::test]
async fn test_team_budget_reserved_against_global() {
    let g = graph().await;
    g.budget
        .set_limit(&BudgetScope::Global, BudgetWindow::Lifetime, 1.0)
        .await
        .unwrap();
    // Global remaining is 1.0; a 5.0 team cannot be created.
    let err = g
        .orchestrator
        .create_team(spec("too-big", 2, 5.0, TeamStrategy::Parallel))
        .await
        .unwrap_err();
    assert!(matches!(err, drover::domain::errors::CoreError::BudgetDenied(_)));
}
