//! Agent repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::{Agent, AgentState, Event};

/// Filter criteria for listing agents.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub state: Option<AgentState>,
    pub team_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
}

/// Repository interface for Agent persistence.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn create(&self, agent: &Agent) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Agent>>;

    async fn update(&self, agent: &Agent) -> CoreResult<()>;

    /// List agents with optional filters, newest spawn first.
    async fn list(&self, filter: AgentFilter) -> CoreResult<Vec<Agent>>;

    async fn list_by_team(&self, team_id: Uuid) -> CoreResult<Vec<Agent>>;

    /// Count agents in non-terminal states.
    async fn count_live(&self) -> CoreResult<u64>;

    /// Persist a lifecycle transition: the updated agent row and its
    /// event row are written in one transaction, so the store can never
    /// hold one without the other.
    async fn persist_transition(&self, agent: &Agent, event: &Event) -> CoreResult<()>;
}
