//! Event envelope and payload types.
//!
//! The `kind` strings are wire-stable: consumers match on them and payload
//! fields are additive only. Unknown fields arriving from other processes
//! land in the `extra` map rather than failing deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed payload, one variant per wire-stable event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // Agent lifecycle
    AgentSpawning { attempt: u32 },
    AgentReady { session_key: String },
    AgentRunning {},
    AgentPaused {},
    AgentResumed {},
    AgentCompleted { tokens_in: u64, tokens_out: u64, cost_usd: f64 },
    AgentFailed { error: String, retry_count: u32 },
    AgentKilled { reason: String },
    AgentRetrying { attempt: u32, max_attempts: u32, delay_ms: u64 },

    // Team lifecycle
    TeamCreated { name: String, size: usize, strategy: String },
    TeamRunning {},
    TeamPaused { reason: String },
    TeamResumed {},
    TeamCompleted { budget_consumed: f64 },
    TeamFailed { reason: String },
    TeamDegraded { failed_count: u32, failure_budget: u32 },
    TeamScaled { from_size: usize, to_size: usize, requested_delta: i64 },

    // Budget ladder
    BudgetWarning { scope: String, consumed_fraction: f64 },
    BudgetThrottle { scope: String, consumed_fraction: f64 },
    BudgetExhausted { scope: String },

    // Gateway connection
    GatewayConnected { connection_id: String, protocol_version: u32 },
    GatewayDisconnected { reason: String },
    GatewayReconnecting { attempt: u32, delay_ms: u64 },
    GatewayResyncGap { from_seq: u64, to_seq: u64 },

    // Bus health
    SubscriberError { subscription: String, error: String },
    LagWarning { subscription: String, dropped: u64 },
    MirrorFailed { error: String },

    // Kill reaper
    OrphanSession { session_key: String, attempts: u32 },

    // Self-inspection
    AutoImprovementCycle { checks_run: usize, checks_failed: usize, teams_spawned: usize },
}

impl EventPayload {
    /// The wire-stable kind string for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentSpawning { .. } => "agent_spawning",
            Self::AgentReady { .. } => "agent_ready",
            Self::AgentRunning {} => "agent_running",
            Self::AgentPaused {} => "agent_paused",
            Self::AgentResumed {} => "agent_resumed",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::AgentFailed { .. } => "agent_failed",
            Self::AgentKilled { .. } => "agent_killed",
            Self::AgentRetrying { .. } => "agent_retrying",
            Self::TeamCreated { .. } => "team_created",
            Self::TeamRunning {} => "team_running",
            Self::TeamPaused { .. } => "team_paused",
            Self::TeamResumed {} => "team_resumed",
            Self::TeamCompleted { .. } => "team_completed",
            Self::TeamFailed { .. } => "team_failed",
            Self::TeamDegraded { .. } => "team_degraded",
            Self::TeamScaled { .. } => "team_scaled",
            Self::BudgetWarning { .. } => "budget_warning",
            Self::BudgetThrottle { .. } => "budget_throttle",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::GatewayConnected { .. } => "gateway_connected",
            Self::GatewayDisconnected { .. } => "gateway_disconnected",
            Self::GatewayReconnecting { .. } => "gateway_reconnecting",
            Self::GatewayResyncGap { .. } => "gateway_resync_gap",
            Self::SubscriberError { .. } => "subscriber_error",
            Self::LagWarning { .. } => "lag_warning",
            Self::MirrorFailed { .. } => "mirror_failed",
            Self::OrphanSession { .. } => "orphan_session",
            Self::AutoImprovementCycle { .. } => "auto_improvement_cycle",
        }
    }
}

/// The event envelope published on the bus and persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Monotonic sequence assigned by the bus at publish.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Component that published the event.
    pub source: String,
    pub agent_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub payload: EventPayload,
    /// Forward-compatible additive fields, serialized in key order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// Build an event with seq 0; the bus assigns the real sequence.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            seq: 0,
            timestamp: Utc::now(),
            source: source.into(),
            agent_id: None,
            team_id: None,
            payload,
            extra: BTreeMap::new(),
        }
    }

    pub fn for_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn for_team(mut self, team_id: Uuid) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Filter for subscriptions and replay queries.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Kind strings to accept; `None` is a wildcard.
    pub kinds: Option<HashSet<String>>,
    pub agent_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: Some(kinds.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn for_agent(agent_id: Uuid) -> Self {
        Self { agent_id: Some(agent_id), ..Default::default() }
    }

    pub fn for_team(team_id: Uuid) -> Self {
        Self { team_id: Some(team_id), ..Default::default() }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(event.kind()) {
                return false;
            }
        }
        if let Some(agent_id) = self.agent_id {
            if event.agent_id != Some(agent_id) {
                return false;
            }
        }
        if let Some(team_id) = self.team_id {
            if event.team_id != Some(team_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_wire_stable() {
        assert_eq!(EventPayload::AgentSpawning { attempt: 0 }.kind(), "agent_spawning");
        assert_eq!(
            EventPayload::TeamScaled { from_size: 3, to_size: 5, requested_delta: 2 }.kind(),
            "team_scaled"
        );
        assert_eq!(
            EventPayload::GatewayResyncGap { from_seq: 1, to_seq: 9 }.kind(),
            "gateway_resync_gap"
        );
        assert_eq!(
            EventPayload::AutoImprovementCycle { checks_run: 3, checks_failed: 0, teams_spawned: 0 }
                .kind(),
            "auto_improvement_cycle"
        );
    }

    #[test]
    fn test_serialized_tag_matches_kind() {
        let payload = EventPayload::AgentRetrying { attempt: 1, max_attempts: 3, delay_ms: 1000 };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "agent_retrying");
        assert_eq!(json["data"]["attempt"], 1);
    }

    #[test]
    fn test_filter_by_kind_and_agent() {
        let agent_id = Uuid::new_v4();
        let event = Event::new("lifecycle", EventPayload::AgentRunning {}).for_agent(agent_id);

        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::for_kinds(["agent_running"]).matches(&event));
        assert!(!EventFilter::for_kinds(["agent_paused"]).matches(&event));
        assert!(EventFilter::for_agent(agent_id).matches(&event));
        assert!(!EventFilter::for_agent(Uuid::new_v4()).matches(&event));
    }

    #[test]
    fn test_envelope_roundtrip_preserves_extra() {
        let mut event = Event::new("test", EventPayload::TeamRunning {});
        event.extra.insert("deploy_ring".to_string(), serde_json::json!(2));

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra["deploy_ring"], serde_json::json!(2));
        assert_eq!(back.kind(), "team_running");
    }
}
