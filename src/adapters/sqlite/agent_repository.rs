//! SQLite implementation of the AgentRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Agent, AgentState, Event, SafetyBoundaries, TaskSpec};
use crate::domain::ports::{AgentFilter, AgentRepository};

use super::event_repository::bind_event_insert;

#[derive(Clone)]
pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn upsert_query(agent: &Agent) -> CoreResult<sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>>> {
        let task_spec = agent.task_spec.as_ref().map(serde_json::to_string).transpose()?;
        let child_ids = serde_json::to_string(&agent.child_ids)?;
        let safety = serde_json::to_string(&agent.safety)?;

        Ok(sqlx::query(
            r#"INSERT INTO agents (id, label, model, provider, task, task_spec, state, team_id,
               parent_id, child_ids, retry_count, max_retries, last_error, budget_limit,
               safety_boundaries, spawned_at, completed_at, runtime_ms, pause_time, session_key)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 label = excluded.label,
                 state = excluded.state,
                 team_id = excluded.team_id,
                 parent_id = excluded.parent_id,
                 child_ids = excluded.child_ids,
                 retry_count = excluded.retry_count,
                 max_retries = excluded.max_retries,
                 last_error = excluded.last_error,
                 budget_limit = excluded.budget_limit,
                 safety_boundaries = excluded.safety_boundaries,
                 completed_at = excluded.completed_at,
                 runtime_ms = excluded.runtime_ms,
                 pause_time = excluded.pause_time,
                 session_key = excluded.session_key"#,
        )
        .bind(agent.id.to_string())
        .bind(agent.label.clone())
        .bind(agent.model.clone())
        .bind(agent.provider.clone())
        .bind(agent.task.clone())
        .bind(task_spec)
        .bind(agent.state.as_str())
        .bind(agent.team_id.map(|id| id.to_string()))
        .bind(agent.parent_id.map(|id| id.to_string()))
        .bind(child_ids)
        .bind(agent.retry_count as i64)
        .bind(agent.max_retries as i64)
        .bind(agent.last_error.clone())
        .bind(agent.budget_limit)
        .bind(safety)
        .bind(agent.spawned_at.to_rfc3339())
        .bind(agent.completed_at.map(|t| t.to_rfc3339()))
        .bind(agent.runtime_ms as i64)
        .bind(agent.pause_time.map(|t| t.to_rfc3339()))
        .bind(agent.session_key.clone()))
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn create(&self, agent: &Agent) -> CoreResult<()> {
        Self::upsert_query(agent)?.execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, agent: &Agent) -> CoreResult<()> {
        let result = Self::upsert_query(agent)?.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::agent_not_found(agent.id));
        }
        Ok(())
    }

    async fn list(&self, filter: AgentFilter) -> CoreResult<Vec<Agent>> {
        let mut sql = String::from("SELECT * FROM agents WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(state) = &filter.state {
            sql.push_str(" AND state = ?");
            bindings.push(state.as_str().to_string());
        }
        if let Some(team_id) = &filter.team_id {
            sql.push_str(" AND team_id = ?");
            bindings.push(team_id.to_string());
        }
        if let Some(parent_id) = &filter.parent_id {
            sql.push_str(" AND parent_id = ?");
            bindings.push(parent_id.to_string());
        }
        sql.push_str(" ORDER BY spawned_at DESC");

        let mut query = sqlx::query_as::<_, AgentRow>(&sql);
        for binding in &bindings {
            query = query.bind(binding);
        }
        let rows: Vec<AgentRow> = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_team(&self, team_id: Uuid) -> CoreResult<Vec<Agent>> {
        self.list(AgentFilter { team_id: Some(team_id), ..Default::default() }).await
    }

    async fn count_live(&self) -> CoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agents WHERE state IN ('spawning', 'idle', 'running', 'paused')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn persist_transition(&self, agent: &Agent, event: &Event) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_query(agent)?.execute(&mut *tx).await?;
        bind_event_insert(event)?.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    label: Option<String>,
    model: String,
    provider: String,
    task: String,
    task_spec: Option<String>,
    state: String,
    team_id: Option<String>,
    parent_id: Option<String>,
    child_ids: Option<String>,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    budget_limit: f64,
    safety_boundaries: String,
    spawned_at: String,
    completed_at: Option<String>,
    runtime_ms: i64,
    pause_time: Option<String>,
    session_key: Option<String>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = CoreError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        let state = AgentState::parse_str(&row.state).ok_or_else(|| {
            CoreError::internal(std::io::Error::other(format!("invalid state: {}", row.state)))
        })?;
        let task_spec: Option<TaskSpec> =
            row.task_spec.as_deref().map(serde_json::from_str).transpose()?;
        let child_ids: Vec<Uuid> = super::parse_json_or_default(row.child_ids)?;
        let safety: SafetyBoundaries = serde_json::from_str(&row.safety_boundaries)?;

        Ok(Agent {
            id: super::parse_uuid(&row.id)?,
            label: row.label,
            model: row.model,
            provider: row.provider,
            task: row.task,
            task_spec,
            state,
            team_id: row.team_id.as_deref().map(super::parse_uuid).transpose()?,
            parent_id: row.parent_id.as_deref().map(super::parse_uuid).transpose()?,
            child_ids,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            last_error: row.last_error,
            budget_limit: row.budget_limit,
            safety,
            spawned_at: super::parse_datetime(&row.spawned_at)?,
            completed_at: row.completed_at.as_deref().map(super::parse_datetime).transpose()?,
            runtime_ms: row.runtime_ms as u64,
            pause_time: row.pause_time.as_deref().map(super::parse_datetime).transpose()?,
            session_key: row.session_key,
        })
    }
}
