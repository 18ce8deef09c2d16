//! SQLite implementation of the BudgetRepository.
//!
//! `try_debit` runs as one transaction: every scope row is read with the
//! transaction open, validated against its hard limit, and updated, or
//! the whole debit rolls back untouched. SQLite serializes writers, so
//! concurrent debits against overlapping scopes cannot interleave.

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{BudgetRecord, BudgetScope, BudgetWindow, Usage};
use crate::domain::ports::{BudgetRepository, DebitOutcome};

#[derive(Clone)]
pub struct SqliteBudgetRepository {
    pool: SqlitePool,
}

impl SqliteBudgetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        scope: &BudgetScope,
        window: BudgetWindow,
    ) -> CoreResult<Option<BudgetRow>> {
        let row: Option<BudgetRow> = sqlx::query_as(
            r#"SELECT * FROM budgets WHERE scope_type = ? AND scope_id = ? AND "window" = ?"#,
        )
        .bind(scope.scope_type())
        .bind(scope.scope_id())
        .bind(window.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl BudgetRepository for SqliteBudgetRepository {
    async fn get(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
    ) -> CoreResult<Option<BudgetRecord>> {
        let row: Option<BudgetRow> = sqlx::query_as(
            r#"SELECT * FROM budgets WHERE scope_type = ? AND scope_id = ? AND "window" = ?"#,
        )
        .bind(scope.scope_type())
        .bind(scope.scope_id())
        .bind(window.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_record(scope.clone(), window)).transpose()
    }

    async fn set_limit(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        limit_cost: f64,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"INSERT INTO budgets (scope_type, scope_id, "window", limit_cost, last_updated)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(scope_type, scope_id, "window")
               DO UPDATE SET limit_cost = excluded.limit_cost, last_updated = excluded.last_updated"#,
        )
        .bind(scope.scope_type())
        .bind(scope.scope_id())
        .bind(window.as_str())
        .bind(limit_cost)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_debit(
        &self,
        scopes: &[(BudgetScope, BudgetWindow)],
        usage: Usage,
    ) -> CoreResult<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Validate every limit with the transaction open before any write.
        for (scope, window) in scopes {
            if let Some(row) = Self::fetch_in_tx(&mut tx, scope, *window).await? {
                let exhausted = row.exhausted != 0;
                let over = row
                    .limit_cost
                    .is_some_and(|limit| row.cost + usage.cost_usd > limit + f64::EPSILON);
                if exhausted || over {
                    tx.rollback().await?;
                    return Ok(DebitOutcome::Denied {
                        scope: scope.clone(),
                        reason: format!(
                            "debit of {:.4} would exceed the hard limit on {scope}",
                            usage.cost_usd
                        ),
                    });
                }
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        for (scope, window) in scopes {
            sqlx::query(
                r#"INSERT INTO budgets (scope_type, scope_id, "window", tokens_in, tokens_out, cost, last_updated)
                   VALUES (?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(scope_type, scope_id, "window") DO UPDATE SET
                     tokens_in = budgets.tokens_in + excluded.tokens_in,
                     tokens_out = budgets.tokens_out + excluded.tokens_out,
                     cost = budgets.cost + excluded.cost,
                     last_updated = excluded.last_updated"#,
            )
            .bind(scope.scope_type())
            .bind(scope.scope_id())
            .bind(window.as_str())
            .bind(usage.tokens_in as i64)
            .bind(usage.tokens_out as i64)
            .bind(usage.cost_usd)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        let mut committed = Vec::with_capacity(scopes.len());
        for (scope, window) in scopes {
            let row = Self::fetch_in_tx(&mut tx, scope, *window).await?.ok_or_else(|| {
                CoreError::internal(std::io::Error::other("debited row vanished in transaction"))
            })?;
            committed.push(row.into_record(scope.clone(), *window)?);
        }
        tx.commit().await?;
        Ok(DebitOutcome::Committed(committed))
    }

    async fn reset(&self, scope: &BudgetScope, window: BudgetWindow) -> CoreResult<()> {
        sqlx::query(
            r#"UPDATE budgets SET tokens_in = 0, tokens_out = 0, cost = 0, exhausted = 0,
               last_updated = ? WHERE scope_type = ? AND scope_id = ? AND "window" = ?"#,
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(scope.scope_type())
        .bind(scope.scope_id())
        .bind(window.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_window(&self, window: BudgetWindow) -> CoreResult<()> {
        sqlx::query(
            r#"UPDATE budgets SET tokens_in = 0, tokens_out = 0, cost = 0, exhausted = 0,
               last_updated = ? WHERE "window" = ?"#,
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(window.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_exhausted(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        exhausted: bool,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"INSERT INTO budgets (scope_type, scope_id, "window", exhausted, last_updated)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(scope_type, scope_id, "window")
               DO UPDATE SET exhausted = excluded.exhausted, last_updated = excluded.last_updated"#,
        )
        .bind(scope.scope_type())
        .bind(scope.scope_id())
        .bind(window.as_str())
        .bind(i32::from(exhausted))
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct BudgetRow {
    #[allow(dead_code)]
    scope_type: String,
    #[allow(dead_code)]
    scope_id: String,
    #[allow(dead_code)]
    window: String,
    tokens_in: i64,
    tokens_out: i64,
    cost: f64,
    limit_cost: Option<f64>,
    exhausted: i64,
    last_updated: String,
}

impl BudgetRow {
    fn into_record(self, scope: BudgetScope, window: BudgetWindow) -> CoreResult<BudgetRecord> {
        Ok(BudgetRecord {
            scope,
            window,
            tokens_in: self.tokens_in as u64,
            tokens_out: self.tokens_out as u64,
            cost_usd: self.cost,
            limit_cost: self.limit_cost,
            exhausted: self.exhausted != 0,
            last_updated: super::parse_datetime(&self.last_updated)?,
        })
    }
}
