//! In-memory agent repository.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Agent, Event};
use crate::domain::ports::{AgentFilter, AgentRepository, EventRepository};

/// Map-backed agent store. Transitions and their events commit under one
/// lock, mirroring the transactional guarantee of the SQLite store.
pub struct InMemoryAgentRepository {
    agents: Mutex<HashMap<Uuid, Agent>>,
    /// Optional event sink so `persist_transition` lands both rows.
    events: Option<Arc<dyn EventRepository>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self { agents: Mutex::new(HashMap::new()), events: None }
    }

    pub fn with_events(events: Arc<dyn EventRepository>) -> Self {
        Self { agents: Mutex::new(HashMap::new()), events: Some(events) }
    }
}

impl Default for InMemoryAgentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn create(&self, agent: &Agent) -> CoreResult<()> {
        let mut agents = self.agents.lock().await;
        agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Agent>> {
        let agents = self.agents.lock().await;
        Ok(agents.get(&id).cloned())
    }

    async fn update(&self, agent: &Agent) -> CoreResult<()> {
        let mut agents = self.agents.lock().await;
        if !agents.contains_key(&agent.id) {
            return Err(CoreError::agent_not_found(agent.id));
        }
        agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn list(&self, filter: AgentFilter) -> CoreResult<Vec<Agent>> {
        let agents = self.agents.lock().await;
        let mut result: Vec<Agent> = agents
            .values()
            .filter(|a| filter.state.is_none_or(|s| a.state == s))
            .filter(|a| filter.team_id.is_none_or(|t| a.team_id == Some(t)))
            .filter(|a| filter.parent_id.is_none_or(|p| a.parent_id == Some(p)))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.spawned_at.cmp(&a.spawned_at));
        Ok(result)
    }

    async fn list_by_team(&self, team_id: Uuid) -> CoreResult<Vec<Agent>> {
        self.list(AgentFilter { team_id: Some(team_id), ..Default::default() }).await
    }

    async fn count_live(&self) -> CoreResult<u64> {
        let agents = self.agents.lock().await;
        Ok(agents.values().filter(|a| a.state.is_live()).count() as u64)
    }

    async fn persist_transition(&self, agent: &Agent, event: &Event) -> CoreResult<()> {
        let mut agents = self.agents.lock().await;
        agents.insert(agent.id, agent.clone());
        if let Some(events) = &self.events {
            events.append(event).await?;
        }
        Ok(())
    }
}
