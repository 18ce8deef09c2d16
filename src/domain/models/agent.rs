//! Agent domain model.
//!
//! An agent is one unit of work execution with its own state machine,
//! owned exclusively by the lifecycle manager. The state set and the
//! permitted transitions are fixed; everything else on the record is
//! descriptive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Session requested from the runtime provider, not yet ready.
    Spawning,
    /// Session ready, waiting for work.
    Idle,
    /// Executing a dispatched task.
    Running,
    /// Suspended by operator or budget throttle.
    Paused,
    /// Terminal: produced a result.
    Completed,
    /// Terminal: errored past its retry budget.
    Failed,
    /// Terminal: killed by operator, team, or budget controller.
    Killed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "spawning" => Some(Self::Spawning),
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    /// Live states hold a runtime session (or a queued retry).
    pub const fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Validate a transition against the lifecycle table.
    ///
    /// `Spawning -> Spawning` is the retry-after-backoff re-entry and
    /// `Failed -> Spawning` is the operator `retry` path.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::{Completed, Failed, Idle, Killed, Paused, Running, Spawning};
        matches!(
            (self, next),
            (Spawning, Idle)
                | (Spawning, Spawning)
                | (Spawning, Failed)
                | (Spawning, Killed)
                | (Idle, Running)
                | (Idle, Killed)
                | (Running, Completed)
                | (Running, Spawning)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Killed)
                | (Paused, Idle)
                | (Paused, Killed)
                | (Failed, Spawning)
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured task description attached to an agent at spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Repository-relative path the task centers on.
    pub target_path: Option<String>,
    /// Path globs the agent may touch.
    #[serde(default)]
    pub scope: Vec<String>,
    /// What the agent is trying to achieve.
    pub objective: String,
    /// Hard constraints on how it gets there.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// How completion is judged.
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl TaskSpec {
    pub fn new(objective: impl Into<String>) -> Self {
        Self { objective: objective.into(), ..Default::default() }
    }

    pub fn with_scope(mut self, globs: Vec<String>) -> Self {
        self.scope = globs;
        self
    }

    pub fn with_target_path(mut self, path: impl Into<String>) -> Self {
        self.target_path = Some(path.into());
        self
    }
}

/// File and tool restrictions applied to an agent's session.
///
/// The default is deny-by-default: sandboxed with no writable globs.
/// Relaxation is an explicit opt-in at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyBoundaries {
    /// Globs the agent may write to. Empty means read-only.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Tool names the agent may never invoke.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Whether the session runs inside the sandbox.
    #[serde(default = "default_sandboxed")]
    pub sandboxed: bool,
}

fn default_sandboxed() -> bool {
    true
}

impl Default for SafetyBoundaries {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            denied_tools: Vec::new(),
            sandboxed: true,
        }
    }
}

impl SafetyBoundaries {
    /// Check a repository-relative path against the allow list.
    pub fn permits_path(&self, path: &str) -> bool {
        self.allowed_paths.iter().any(|glob| glob_match(glob, path))
    }
}

/// Minimal glob matching: `*` within a segment, `**` across segments.
fn glob_match(pattern: &str, path: &str) -> bool {
    fn inner(pat: &[&str], segs: &[&str]) -> bool {
        match (pat.first(), segs.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                inner(&pat[1..], segs) || (!segs.is_empty() && inner(pat, &segs[1..]))
            }
            (Some(p), Some(s)) => segment_match(p, s) && inner(&pat[1..], &segs[1..]),
            _ => false,
        }
    }
    fn segment_match(pat: &str, seg: &str) -> bool {
        if pat == "*" {
            return true;
        }
        if let Some(idx) = pat.find('*') {
            let (prefix, suffix) = (&pat[..idx], &pat[idx + 1..]);
            seg.len() >= prefix.len() + suffix.len()
                && seg.starts_with(prefix)
                && seg.ends_with(suffix)
        } else {
            pat == seg
        }
    }
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    inner(&pat, &segs)
}

/// An agent record as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Optional human-facing label.
    pub label: Option<String>,
    /// Model name, opaque to the core (used for pricing lookup).
    pub model: String,
    /// Provider name, opaque to the core.
    pub provider: String,
    /// Immutable free-form task text.
    pub task: String,
    /// Optional structured task description.
    pub task_spec: Option<TaskSpec>,
    pub state: AgentState,
    pub team_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub child_ids: Vec<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Hard cost ceiling in USD for this agent (including retries).
    pub budget_limit: f64,
    pub safety: SafetyBoundaries,
    pub spawned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated execution time, excluding paused stretches.
    pub runtime_ms: u64,
    /// When the current pause began, if paused.
    pub pause_time: Option<DateTime<Utc>>,
    /// Opaque handle into the runtime provider.
    pub session_key: Option<String>,
}

impl Agent {
    /// Create a new agent record in `Spawning`.
    pub fn new(task: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: None,
            model: model.into(),
            provider: "gateway".to_string(),
            task: task.into(),
            task_spec: None,
            state: AgentState::Spawning,
            team_id: None,
            parent_id: None,
            child_ids: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            budget_limit: 1.0,
            safety: SafetyBoundaries::default(),
            spawned_at: Utc::now(),
            completed_at: None,
            runtime_ms: 0,
            pause_time: None,
            session_key: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_team(mut self, team_id: Uuid) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_task_spec(mut self, spec: TaskSpec) -> Self {
        self.task_spec = Some(spec);
        self
    }

    pub fn with_budget_limit(mut self, usd: f64) -> Self {
        self.budget_limit = usd;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_safety(mut self, safety: SafetyBoundaries) -> Self {
        self.safety = safety;
        self
    }

    /// Whether another spawn attempt is permitted.
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Display name: label if set, else the first id segment.
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| {
            let id = self.id.to_string();
            id.split('-').next().unwrap_or(&id).to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            AgentState::Spawning,
            AgentState::Idle,
            AgentState::Running,
            AgentState::Paused,
            AgentState::Completed,
            AgentState::Failed,
            AgentState::Killed,
        ] {
            assert_eq!(AgentState::parse_str(state.as_str()), Some(state));
        }
        assert_eq!(AgentState::parse_str("bogus"), None);
    }

    #[test]
    fn test_terminal_states_admit_nothing() {
        for terminal in [AgentState::Completed, AgentState::Failed, AgentState::Killed] {
            for next in [
                AgentState::Spawning,
                AgentState::Idle,
                AgentState::Running,
                AgentState::Paused,
                AgentState::Completed,
                AgentState::Killed,
            ] {
                // Failed -> Spawning is the one sanctioned exit (manual retry).
                if terminal == AgentState::Failed && next == AgentState::Spawning {
                    continue;
                }
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn test_lifecycle_paths() {
        assert!(AgentState::Spawning.can_transition_to(AgentState::Idle));
        assert!(AgentState::Spawning.can_transition_to(AgentState::Spawning));
        assert!(AgentState::Idle.can_transition_to(AgentState::Running));
        assert!(AgentState::Running.can_transition_to(AgentState::Paused));
        assert!(AgentState::Paused.can_transition_to(AgentState::Idle));
        assert!(AgentState::Running.can_transition_to(AgentState::Spawning));
        assert!(!AgentState::Idle.can_transition_to(AgentState::Completed));
        assert!(!AgentState::Paused.can_transition_to(AgentState::Running));
    }

    #[test]
    fn test_agent_builder() {
        let team = Uuid::new_v4();
        let agent = Agent::new("review the parser", "sonnet")
            .with_team(team)
            .with_budget_limit(0.25)
            .with_max_retries(2)
            .with_label("parser-reviewer");

        assert_eq!(agent.state, AgentState::Spawning);
        assert_eq!(agent.team_id, Some(team));
        assert_eq!(agent.display_name(), "parser-reviewer");
        assert!(agent.can_retry());
        assert!(agent.safety.sandboxed, "safety must default to sandboxed");
        assert!(agent.safety.allowed_paths.is_empty());
    }

    #[test]
    fn test_safety_glob_matching() {
        let safety = SafetyBoundaries {
            allowed_paths: vec!["src/**/*.rs".to_string(), "docs/*.md".to_string()],
            denied_tools: vec![],
            sandboxed: true,
        };
        assert!(safety.permits_path("src/lib.rs"));
        assert!(safety.permits_path("src/deep/nested/mod.rs"));
        assert!(safety.permits_path("docs/readme.md"));
        assert!(!safety.permits_path("docs/sub/readme.md"));
        assert!(!safety.permits_path("Cargo.toml"));
        assert!(!SafetyBoundaries::default().permits_path("src/lib.rs"));
    }
}
