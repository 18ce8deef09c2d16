//! Team repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::{Team, TeamStatus};

/// Filter criteria for listing teams.
#[derive(Debug, Clone, Default)]
pub struct TeamFilter {
    pub status: Option<TeamStatus>,
    pub name: Option<String>,
}

/// Repository interface for Team persistence.
#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn create(&self, team: &Team) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Team>>;

    async fn update(&self, team: &Team) -> CoreResult<()>;

    /// List teams with optional filters, newest first.
    async fn list(&self, filter: TeamFilter) -> CoreResult<Vec<Team>>;
}
