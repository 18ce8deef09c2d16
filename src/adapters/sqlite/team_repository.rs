//! SQLite implementation of the TeamRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Team, TeamConfig, TeamMetrics, TeamStatus};
use crate::domain::ports::{TeamFilter, TeamRepository};

#[derive(Clone)]
pub struct SqliteTeamRepository {
    pool: SqlitePool,
}

impl SqliteTeamRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn upsert_query(
        team: &Team,
    ) -> CoreResult<sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>>> {
        let config = serde_json::to_string(&team.config)?;
        let agents = serde_json::to_string(&team.agent_ids)?;
        let shared_context = serde_json::to_string(&team.shared_context)?;
        let metrics = serde_json::to_string(&team.metrics)?;

        Ok(sqlx::query(
            r#"INSERT INTO teams (id, name, status, task, config, agents, shared_context,
               metrics, created_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 config = excluded.config,
                 agents = excluded.agents,
                 shared_context = excluded.shared_context,
                 metrics = excluded.metrics,
                 completed_at = excluded.completed_at"#,
        )
        .bind(team.id.to_string())
        .bind(team.name.clone())
        .bind(team.status.as_str())
        .bind(team.task.clone())
        .bind(config)
        .bind(agents)
        .bind(shared_context)
        .bind(metrics)
        .bind(team.created_at.to_rfc3339())
        .bind(team.completed_at.map(|t| t.to_rfc3339())))
    }
}

#[async_trait]
impl TeamRepository for SqliteTeamRepository {
    async fn create(&self, team: &Team) -> CoreResult<()> {
        Self::upsert_query(team)?.execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Team>> {
        let row: Option<TeamRow> = sqlx::query_as("SELECT * FROM teams WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, team: &Team) -> CoreResult<()> {
        let result = Self::upsert_query(team)?.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::team_not_found(team.id));
        }
        Ok(())
    }

    async fn list(&self, filter: TeamFilter) -> CoreResult<Vec<Team>> {
        let mut sql = String::from("SELECT * FROM teams WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(name) = &filter.name {
            sql.push_str(" AND name = ?");
            bindings.push(name.clone());
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query_as::<_, TeamRow>(&sql);
        for binding in &bindings {
            query = query.bind(binding);
        }
        let rows: Vec<TeamRow> = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TeamRow {
    id: String,
    name: String,
    status: String,
    task: String,
    config: String,
    agents: String,
    shared_context: Option<String>,
    metrics: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl TryFrom<TeamRow> for Team {
    type Error = CoreError;

    fn try_from(row: TeamRow) -> Result<Self, Self::Error> {
        let status = TeamStatus::parse_str(&row.status).ok_or_else(|| {
            CoreError::internal(std::io::Error::other(format!("invalid status: {}", row.status)))
        })?;
        let config: TeamConfig = serde_json::from_str(&row.config)?;
        let agent_ids: Vec<Uuid> = serde_json::from_str(&row.agents)?;
        let shared_context = super::parse_json_or_default(row.shared_context)?;
        let metrics: TeamMetrics = super::parse_json_or_default(row.metrics)?;

        Ok(Team {
            id: super::parse_uuid(&row.id)?,
            name: row.name,
            status,
            task: row.task,
            config,
            agent_ids,
            metrics,
            shared_context,
            created_at: super::parse_datetime(&row.created_at)?,
            completed_at: row.completed_at.as_deref().map(super::parse_datetime).transpose()?,
        })
    }
}
