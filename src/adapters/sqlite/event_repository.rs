//! SQLite implementation of the durable event tail.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Event, EventId, EventPayload};
use crate::domain::ports::{EventQuery, EventRepository};

/// Build the insert for one event. Shared with the agent repository so a
/// lifecycle transition can write both rows in one transaction.
pub(crate) fn bind_event_insert(
    event: &Event,
) -> CoreResult<sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>>> {
    let payload = serde_json::to_string(&event.payload)?;
    let extra = if event.extra.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&event.extra)?)
    };
    // The payload column carries the typed payload; additive fields ride
    // in the same JSON document under "extra".
    let document = match extra {
        Some(extra) => format!(r#"{{"payload":{payload},"extra":{extra}}}"#),
        None => format!(r#"{{"payload":{payload}}}"#),
    };

    Ok(sqlx::query(
        r#"INSERT INTO events (id, seq, timestamp, type, source, agent_id, team_id, payload)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(event.id.to_string())
    .bind(event.seq as i64)
    .bind(event.timestamp.to_rfc3339())
    .bind(event.kind())
    .bind(event.source.clone())
    .bind(event.agent_id.map(|id| id.to_string()))
    .bind(event.team_id.map(|id| id.to_string()))
    .bind(document))
}

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn append(&self, event: &Event) -> CoreResult<()> {
        bind_event_insert(event)?.execute(&self.pool).await?;
        Ok(())
    }

    async fn latest_seq(&self) -> CoreResult<Option<u64>> {
        let (seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq.map(|seq| seq as u64))
    }

    async fn list_recent(&self, n: usize) -> CoreResult<Vec<Event>> {
        let rows: Vec<EventRow> =
            sqlx::query_as("SELECT * FROM events ORDER BY seq DESC LIMIT ?")
                .bind(n as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn query(&self, query: EventQuery) -> CoreResult<Vec<Event>> {
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(kind) = &query.kind {
            sql.push_str(" AND type = ?");
            bindings.push(kind.clone());
        }
        if let Some(agent_id) = &query.agent_id {
            sql.push_str(" AND agent_id = ?");
            bindings.push(agent_id.to_string());
        }
        if let Some(team_id) = &query.team_id {
            sql.push_str(" AND team_id = ?");
            bindings.push(team_id.to_string());
        }
        sql.push_str(" ORDER BY seq DESC LIMIT ?");

        let limit = if query.limit == 0 { 1_000 } else { query.limit };
        let mut q = sqlx::query_as::<_, EventRow>(&sql);
        for binding in &bindings {
            q = q.bind(binding);
        }
        q = q.bind(limit as i64);

        let rows: Vec<EventRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    seq: i64,
    timestamp: String,
    #[allow(dead_code)]
    #[sqlx(rename = "type")]
    kind: String,
    source: String,
    agent_id: Option<String>,
    team_id: Option<String>,
    payload: String,
}

#[derive(serde::Deserialize)]
struct EventDocument {
    payload: EventPayload,
    #[serde(default)]
    extra: std::collections::BTreeMap<String, serde_json::Value>,
}

impl TryFrom<EventRow> for Event {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let document: EventDocument = serde_json::from_str(&row.payload)?;
        Ok(Event {
            id: EventId(super::parse_uuid(&row.id)?),
            seq: row.seq as u64,
            timestamp: super::parse_datetime(&row.timestamp)?,
            source: row.source,
            agent_id: row.agent_id.as_deref().map(super::parse_uuid).transpose()?,
            team_id: row.team_id.as_deref().map(super::parse_uuid).transpose()?,
            payload: document.payload,
            extra: document.extra,
        })
    }
}
