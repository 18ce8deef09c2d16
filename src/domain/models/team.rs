//! Team domain model.
//!
//! A team is a named group of agents pursuing a shared objective under a
//! shared budget. The orchestrator derives team status from member states;
//! nothing else writes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::agent::AgentState;

/// Status of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    /// Created, members not yet spawned.
    Pending,
    /// Members spawned and progressing.
    Running,
    /// Suspended (operator, failure budget, or budget throttle).
    Paused,
    /// Terminal: objective met.
    Completed,
    /// Terminal: destroyed or failed past the failure budget.
    Failed,
}

impl TeamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TeamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch and aggregation pattern for a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeamStrategy {
    /// All members work concurrently on identical or partitioned sub-tasks.
    #[default]
    Parallel,
    /// Members run one after another, each fed the previous result.
    Pipeline,
    /// N mappers, then a single reducer over their results.
    MapReduce,
    /// A coordinator that may spawn sub-agents recursively.
    Tree,
}

impl TeamStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Pipeline => "pipeline",
            Self::MapReduce => "map_reduce",
            Self::Tree => "tree",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "parallel" => Some(Self::Parallel),
            "pipeline" => Some(Self::Pipeline),
            "map_reduce" | "mapreduce" => Some(Self::MapReduce),
            "tree" => Some(Self::Tree),
            _ => None,
        }
    }
}

/// Static configuration of a team, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Target concurrency.
    pub desired_size: usize,
    /// Autoscaling floor.
    pub min_size: usize,
    /// Autoscaling ceiling.
    pub max_size: usize,
    /// Total budget reserved for the team, USD.
    pub budget_allocated: f64,
    pub strategy: TeamStrategy,
    /// Failed members tolerated before the team degrades.
    pub failure_budget: u32,
    /// Whether the autoscaler may adjust this team (parallel only).
    #[serde(default)]
    pub autoscale: bool,
    /// Whether member agents may spawn sub-agents. Off for
    /// improvement-loop teams.
    #[serde(default = "default_true")]
    pub allow_subagents: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            desired_size: 3,
            min_size: 1,
            max_size: 10,
            budget_allocated: 1.0,
            strategy: TeamStrategy::Parallel,
            failure_budget: 2,
            autoscale: false,
            allow_subagents: true,
        }
    }
}

impl TeamConfig {
    /// Per-agent budget: even split minus a reserve kept for retries and
    /// replacements.
    pub fn per_agent_budget(&self) -> f64 {
        const OVERHEAD_FACTOR: f64 = 0.10;
        if self.desired_size == 0 {
            return 0.0;
        }
        (self.budget_allocated / self.desired_size as f64) * (1.0 - OVERHEAD_FACTOR)
    }

    /// Clamp a proposed size into `[min_size, max_size]`.
    pub fn clamp_size(&self, size: usize) -> usize {
        size.clamp(self.min_size, self.max_size)
    }
}

/// Live metric snapshot, derived from member states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamMetrics {
    pub budget_consumed: f64,
    pub counts: HashMap<String, usize>,
}

impl TeamMetrics {
    pub fn count_of(&self, state: AgentState) -> usize {
        self.counts.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// A team record as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub status: TeamStatus,
    /// Immutable objective text, dispatched to members per strategy.
    pub task: String,
    pub config: TeamConfig,
    /// Ordered membership; order matters for pipeline dispatch.
    pub agent_ids: Vec<Uuid>,
    pub metrics: TeamMetrics,
    /// Opaque key/value context handed to each member at spawn.
    #[serde(default)]
    pub shared_context: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Team {
    pub fn new(name: impl Into<String>, task: impl Into<String>, config: TeamConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TeamStatus::Pending,
            task: task.into(),
            config,
            agent_ids: Vec::new(),
            metrics: TeamMetrics::default(),
            shared_context: HashMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn budget_remaining(&self) -> f64 {
        (self.config.budget_allocated - self.metrics.budget_consumed).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TeamStatus::Pending,
            TeamStatus::Running,
            TeamStatus::Paused,
            TeamStatus::Completed,
            TeamStatus::Failed,
        ] {
            assert_eq!(TeamStatus::parse_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_strategy_parse_accepts_both_spellings() {
        assert_eq!(TeamStrategy::parse_str("map_reduce"), Some(TeamStrategy::MapReduce));
        assert_eq!(TeamStrategy::parse_str("mapreduce"), Some(TeamStrategy::MapReduce));
        assert_eq!(TeamStrategy::parse_str("waterfall"), None);
    }

    #[test]
    fn test_per_agent_budget_reserves_overhead() {
        let config = TeamConfig {
            desired_size: 4,
            budget_allocated: 2.0,
            ..Default::default()
        };
        let per_agent = config.per_agent_budget();
        assert!((per_agent - 0.45).abs() < 1e-9);
        assert!(per_agent * 4.0 < config.budget_allocated);
    }

    #[test]
    fn test_clamp_size() {
        let config = TeamConfig { min_size: 2, max_size: 8, ..Default::default() };
        assert_eq!(config.clamp_size(0), 2);
        assert_eq!(config.clamp_size(5), 5);
        assert_eq!(config.clamp_size(50), 8);
    }

    #[test]
    fn test_budget_remaining_never_negative() {
        let mut team = Team::new("t", "do work", TeamConfig {
            budget_allocated: 0.5,
            ..Default::default()
        });
        team.metrics.budget_consumed = 0.7;
        assert_eq!(team.budget_remaining(), 0.0);
    }
}
