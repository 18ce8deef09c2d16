//! Budget repository port.

use async_trait::async_trait;

use crate::domain::errors::CoreResult;
use crate::domain::models::{BudgetRecord, BudgetScope, BudgetWindow, Usage};

/// Outcome of an atomic debit attempt.
#[derive(Debug, Clone)]
pub enum DebitOutcome {
    /// Debit committed; the updated records for every touched scope.
    Committed(Vec<BudgetRecord>),
    /// Rejected with no state change; names the scope that would have
    /// exceeded its hard limit.
    Denied { scope: BudgetScope, reason: String },
}

/// Repository interface for budget counters.
///
/// `try_debit` must be serializable under contention: two concurrent
/// debits against overlapping scopes observe each other's committed
/// totals, and a rejection mutates nothing.
#[async_trait]
pub trait BudgetRepository: Send + Sync {
    async fn get(&self, scope: &BudgetScope, window: BudgetWindow)
        -> CoreResult<Option<BudgetRecord>>;

    /// Set or replace the hard cost limit on a scope/window.
    async fn set_limit(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        limit_cost: f64,
    ) -> CoreResult<()>;

    /// Apply `usage` to every `(scope, window)` pair in one transaction.
    /// If any pair would exceed its hard limit, nothing is written.
    async fn try_debit(
        &self,
        scopes: &[(BudgetScope, BudgetWindow)],
        usage: Usage,
    ) -> CoreResult<DebitOutcome>;

    /// Zero out the counters for a scope/window.
    async fn reset(&self, scope: &BudgetScope, window: BudgetWindow) -> CoreResult<()>;

    /// Zero out every record in the given window (scheduled daily reset).
    async fn reset_window(&self, window: BudgetWindow) -> CoreResult<()>;

    /// Mark or clear the exhausted flag on a scope/window.
    async fn set_exhausted(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        exhausted: bool,
    ) -> CoreResult<()>;
}
