//! SQLite store: connection pool, migrations, repositories.

pub mod agent_repository;
pub mod budget_repository;
pub mod connection;
pub mod event_repository;
pub mod migrations;
pub mod team_repository;

pub use agent_repository::SqliteAgentRepository;
pub use budget_repository::SqliteBudgetRepository;
pub use connection::{open_store, open_test_store};
pub use event_repository::SqliteEventRepository;
pub use migrations::{all_embedded_migrations, Migration, Migrator};
pub use team_repository::SqliteTeamRepository;

use crate::domain::errors::CoreError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(s)
        .map_err(|e| CoreError::internal(std::io::Error::other(format!("bad uuid {s}: {e}"))))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::internal(std::io::Error::other(format!("bad timestamp {s}: {e}"))))
}

pub(crate) fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(
    value: Option<String>,
) -> Result<T, CoreError> {
    match value {
        Some(json) if !json.is_empty() => Ok(serde_json::from_str(&json)?),
        _ => Ok(T::default()),
    }
}
