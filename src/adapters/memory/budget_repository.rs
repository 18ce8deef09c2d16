//! In-memory budget counters.
//!
//! A single map lock makes every multi-scope debit serializable: readers
//! and writers observe whole committed debits or nothing.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::errors::CoreResult;
use crate::domain::models::{BudgetRecord, BudgetScope, BudgetWindow, Usage};
use crate::domain::ports::{BudgetRepository, DebitOutcome};

type Key = (String, String, &'static str);

fn key(scope: &BudgetScope, window: BudgetWindow) -> Key {
    (scope.scope_type().to_string(), scope.scope_id(), window.as_str())
}

pub struct InMemoryBudgetRepository {
    records: Mutex<HashMap<Key, BudgetRecord>>,
}

impl InMemoryBudgetRepository {
    pub fn new() -> Self {
        Self { records: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryBudgetRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BudgetRepository for InMemoryBudgetRepository {
    async fn get(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
    ) -> CoreResult<Option<BudgetRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&key(scope, window)).cloned())
    }

    async fn set_limit(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        limit_cost: f64,
    ) -> CoreResult<()> {
        let mut records = self.records.lock().await;
        records
            .entry(key(scope, window))
            .or_insert_with(|| BudgetRecord::new(scope.clone(), window))
            .limit_cost = Some(limit_cost);
        Ok(())
    }

    async fn try_debit(
        &self,
        scopes: &[(BudgetScope, BudgetWindow)],
        usage: Usage,
    ) -> CoreResult<DebitOutcome> {
        let mut records = self.records.lock().await;

        // Validate against every hard limit before touching anything.
        for (scope, window) in scopes {
            if let Some(record) = records.get(&key(scope, *window)) {
                if record.exhausted || record.would_exceed(usage.cost_usd) {
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

        let mut committed = Vec::with_capacity(scopes.len());
        for (scope, window) in scopes {
            let record = records
                .entry(key(scope, *window))
                .or_insert_with(|| BudgetRecord::new(scope.clone(), *window));
            record.apply(usage);
            committed.push(record.clone());
        }
        Ok(DebitOutcome::Committed(committed))
    }

    async fn reset(&self, scope: &BudgetScope, window: BudgetWindow) -> CoreResult<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&key(scope, window)) {
            record.tokens_in = 0;
            record.tokens_out = 0;
            record.cost_usd = 0.0;
            record.exhausted = false;
            record.last_updated = chrono::Utc::now();
        }
        Ok(())
    }

    async fn reset_window(&self, window: BudgetWindow) -> CoreResult<()> {
        let mut records = self.records.lock().await;
        for record in records.values_mut().filter(|r| r.window == window) {
            record.tokens_in = 0;
            record.tokens_out = 0;
            record.cost_usd = 0.0;
            record.exhausted = false;
            record.last_updated = chrono::Utc::now();
        }
        Ok(())
    }

    async fn set_exhausted(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        exhausted: bool,
    ) -> CoreResult<()> {
        let mut records = self.records.lock().await;
        records
            .entry(key(scope, window))
            .or_insert_with(|| BudgetRecord::new(scope.clone(), window))
            .exhausted = exhausted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_denied_debit_mutates_nothing() {
        let repo = InMemoryBudgetRepository::new();
        let team = BudgetScope::Team(Uuid::new_v4());
        let agent = BudgetScope::Agent(Uuid::new_v4());
        repo.set_limit(&team, BudgetWindow::Lifetime, 0.01).await.unwrap();

        let scopes = vec![
            (agent.clone(), BudgetWindow::Lifetime),
            (team.clone(), BudgetWindow::Lifetime),
        ];
        let outcome = repo.try_debit(&scopes, Usage::new(1, 1, 0.02)).await.unwrap();
        assert!(matches!(outcome, DebitOutcome::Denied { .. }));
        // Neither scope was touched, including the unlimited agent scope.
        assert!(repo.get(&agent, BudgetWindow::Lifetime).await.unwrap().is_none());
        let team_rec = repo.get(&team, BudgetWindow::Lifetime).await.unwrap().unwrap();
        assert_eq!(team_rec.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_debits_serialize() {
        let repo = std::sync::Arc::new(InMemoryBudgetRepository::new());
        let scope = BudgetScope::Global;
        let mut handles = Vec::new();
        for _ in 0..50 {
            let repo = repo.clone();
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                repo.try_debit(&[(scope, BudgetWindow::Lifetime)], Usage::new(10, 5, 0.001))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let record = repo.get(&scope, BudgetWindow::Lifetime).await.unwrap().unwrap();
        assert_eq!(record.tokens_in, 500);
        assert!((record.cost_usd - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reset_window_only_touches_that_window() {
        let repo = InMemoryBudgetRepository::new();
        let scopes = vec![
            (BudgetScope::Global, BudgetWindow::Day),
            (BudgetScope::Global, BudgetWindow::Lifetime),
        ];
        repo.try_debit(&scopes, Usage::new(100, 50, 0.5)).await.unwrap();
        repo.reset_window(BudgetWindow::Day).await.unwrap();

        let day = repo.get(&BudgetScope::Global, BudgetWindow::Day).await.unwrap().unwrap();
        assert_eq!(day.cost_usd, 0.0);
        let lifetime =
            repo.get(&BudgetScope::Global, BudgetWindow::Lifetime).await.unwrap().unwrap();
        assert!((lifetime.cost_usd - 0.5).abs() < 1e-9);
    }
}
