//! Opening the SQLite state store.
//!
//! WAL journal mode plus a generous busy timeout gives the orchestrator
//! process an effective single-writer guarantee on a single host. The
//! pool is sized from [`DatabaseConfig`] and probed with a query before
//! it is handed to the repositories, so a misconfigured path fails at
//! startup rather than on the first lifecycle transition.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::DatabaseConfig;

/// Open the store at `config.path`, creating the file and its parent
/// directory if missing, and verify it answers queries.
pub async fn open_store(config: &DatabaseConfig) -> CoreResult<SqlitePool> {
    if config.path.is_empty() {
        return Err(CoreError::InvalidInput("database path cannot be empty".into()));
    }
    ensure_parent_dir(&config.path)?;

    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .map_err(|e| {
            CoreError::Transient(format!("failed to open store at {}: {e}", config.path))
        })?;

    probe(&pool, &config.path).await?;
    Ok(pool)
}

/// Single-connection in-memory store for tests.
pub async fn open_test_store() -> CoreResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .shared_cache(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| CoreError::Transient(format!("failed to open in-memory store: {e}")))?;

    probe(&pool, ":memory:").await?;
    Ok(pool)
}

/// A store that cannot answer `SELECT 1` is a configuration problem,
/// not a runtime blip.
async fn probe(pool: &SqlitePool, path: &str) -> CoreResult<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("store at {path} is unreadable: {e}")))?;
    Ok(())
}

fn ensure_parent_dir(path: &str) -> CoreResult<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Fatal(format!("cannot create store directory {}: {e}", parent.display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_test_store_answers_queries() {
        let pool = open_test_store().await.unwrap();
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_open_store_rejects_empty_path() {
        let config = DatabaseConfig { path: String::new(), max_connections: 5 };
        let err = open_store(&config).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_open_store_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("drover.db");
        let config = DatabaseConfig {
            path: path.to_string_lossy().into_owned(),
            max_connections: 2,
        };
        let pool = open_store(&config).await.unwrap();
        assert!(path.parent().unwrap().exists());
        drop(pool);
    }
}
