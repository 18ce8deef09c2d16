//! Domain models: agents, teams, budgets, events, configuration.

pub mod agent;
pub mod budget;
pub mod config;
pub mod event;
pub mod team;

pub use agent::{Agent, AgentState, SafetyBoundaries, TaskSpec};
pub use budget::{BudgetRecord, BudgetScope, BudgetWindow, Usage};
pub use config::{
    BudgetConfig, Config, DatabaseConfig, GatewayConfig, ImprovementConfig, LimitsConfig,
    LoggingConfig, OrchestratorConfig, RetryConfig, RuntimeConfig,
};
pub use event::{Event, EventFilter, EventId, EventPayload};
pub use team::{Team, TeamConfig, TeamMetrics, TeamStatus, TeamStrategy};
