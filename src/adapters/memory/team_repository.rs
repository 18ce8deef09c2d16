//! In-memory team repository.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::Team;
use crate::domain::ports::{TeamFilter, TeamRepository};

pub struct InMemoryTeamRepository {
    teams: Mutex<HashMap<Uuid, Team>>,
}

impl InMemoryTeamRepository {
    pub fn new() -> Self {
        Self { teams: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryTeamRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TeamRepository for InMemoryTeamRepository {
    async fn create(&self, team: &Team) -> CoreResult<()> {
        let mut teams = self.teams.lock().await;
        teams.insert(team.id, team.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Team>> {
        let teams = self.teams.lock().await;
        Ok(teams.get(&id).cloned())
    }

    async fn update(&self, team: &Team) -> CoreResult<()> {
        let mut teams = self.teams.lock().await;
        if !teams.contains_key(&team.id) {
            return Err(CoreError::team_not_found(team.id));
        }
        teams.insert(team.id, team.clone());
        Ok(())
    }

    async fn list(&self, filter: TeamFilter) -> CoreResult<Vec<Team>> {
        let teams = self.teams.lock().await;
        let mut result: Vec<Team> = teams
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.name.as_deref().is_none_or(|n| t.name == n))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }
}
