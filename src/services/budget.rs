//! Budget controller: quantifies and enforces resource limits.
//!
//! Every unit of work reports its usage here. Debits land atomically on
//! the whole scope chain (agent, team, global; daily and lifetime
//! windows), and each committed debit is evaluated against the policy
//! ladder: warn, throttle, hard. Crossing a threshold is announced on the
//! bus; the lifecycle side reacts to the announcements.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::BudgetConfig;
use crate::domain::models::{BudgetRecord, BudgetScope, BudgetWindow, Event, EventPayload, Usage};
use crate::domain::ports::{BudgetRepository, DebitOutcome};
use crate::services::event_bus::EventBus;
use crate::services::pricing;

const SOURCE: &str = "budget";

/// Central budget/safety controller.
pub struct BudgetController {
    repo: Arc<dyn BudgetRepository>,
    bus: Arc<EventBus>,
    config: BudgetConfig,
}

impl BudgetController {
    pub fn new(repo: Arc<dyn BudgetRepository>, bus: Arc<EventBus>, config: BudgetConfig) -> Self {
        Self { repo, bus, config }
    }

    /// Install the global daily cost cap (from `GLOBAL_DAILY_COST_CAP`).
    pub async fn set_global_daily_cap(&self, cap: f64) -> CoreResult<()> {
        self.repo.set_limit(&BudgetScope::Global, BudgetWindow::Day, cap).await
    }

    /// Set the hard cost limit for a scope/window.
    pub async fn set_limit(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        limit_cost: f64,
    ) -> CoreResult<()> {
        self.repo.set_limit(scope, window, limit_cost).await
    }

    /// Read a single record.
    pub async fn get(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
    ) -> CoreResult<Option<BudgetRecord>> {
        self.repo.get(scope, window).await
    }

    /// Remaining budget for a scope/window; `None` when no limit is set.
    pub async fn remaining(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
    ) -> CoreResult<Option<f64>> {
        let record = self.repo.get(scope, window).await?;
        Ok(record.and_then(|r| r.limit_cost.map(|limit| (limit - r.cost_usd).max(0.0))))
    }

    /// Whether a spawn charging up to `requested` against `scope` is
    /// currently permitted. Denies on an exhausted scope or when the
    /// remainder is smaller than the request.
    pub async fn check_spawn_allowed(
        &self,
        scope: &BudgetScope,
        requested: f64,
    ) -> CoreResult<()> {
        for window in [BudgetWindow::Lifetime, BudgetWindow::Day] {
            if let Some(record) = self.repo.get(scope, window).await? {
                if record.exhausted {
                    return Err(CoreError::BudgetDenied(format!("{scope} is exhausted")));
                }
                if let Some(limit) = record.limit_cost {
                    let remaining = (limit - record.cost_usd).max(0.0);
                    if requested > remaining + f64::EPSILON {
                        return Err(CoreError::BudgetDenied(format!(
                            "{scope} has {remaining:.4} remaining, {requested:.4} requested"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Compute cost from the pricing table and debit the scope chain.
    ///
    /// Returns the usage (with cost filled in) on commit. A rejected
    /// debit changes nothing, marks the offending scope exhausted, and
    /// surfaces as `BudgetDenied`.
    pub async fn record_usage(
        &self,
        agent_id: Uuid,
        team_id: Option<Uuid>,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> CoreResult<Usage> {
        let cost = pricing::estimate_cost(model, tokens_in, tokens_out);
        let usage = Usage::new(tokens_in, tokens_out, cost);
        self.debit(agent_id, team_id, usage).await?;
        Ok(usage)
    }

    /// Debit pre-costed usage against the scope chain.
    pub async fn debit(
        &self,
        agent_id: Uuid,
        team_id: Option<Uuid>,
        usage: Usage,
    ) -> CoreResult<()> {
        let scopes = Self::scope_chain(agent_id, team_id);
        match self.repo.try_debit(&scopes, usage).await? {
            DebitOutcome::Committed(records) => {
                self.evaluate_ladder(&records, usage).await;
                Ok(())
            }
            DebitOutcome::Denied { scope, reason } => {
                self.repo
                    .set_exhausted(&scope, Self::window_for(&scope), true)
                    .await?;
                self.bus
                    .publish(
                        Event::new(SOURCE, EventPayload::BudgetExhausted { scope: scope.to_string() })
                            .for_agent(agent_id),
                    )
                    .await;
                Err(CoreError::BudgetDenied(reason))
            }
        }
    }

    /// Reserve a flat cost against a single scope, e.g. clipping a
    /// spawned team's allocation against a dedicated daily ceiling.
    pub async fn reserve(
        &self,
        scope: &BudgetScope,
        window: BudgetWindow,
        cost: f64,
    ) -> CoreResult<()> {
        let usage = Usage::new(0, 0, cost);
        match self.repo.try_debit(&[(scope.clone(), window)], usage).await? {
            DebitOutcome::Committed(records) => {
                self.evaluate_ladder(&records, usage).await;
                Ok(())
            }
            DebitOutcome::Denied { reason, .. } => Err(CoreError::BudgetDenied(reason)),
        }
    }

    /// Manual or scheduled counter reset.
    pub async fn reset(&self, scope: &BudgetScope, window: BudgetWindow) -> CoreResult<()> {
        self.repo.set_exhausted(scope, window, false).await?;
        self.repo.reset(scope, window).await
    }

    /// Background task resetting all daily windows at the configured
    /// wall-clock hour.
    pub fn spawn_daily_reset(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = self;
        tokio::spawn(async move {
            loop {
                let sleep_for = controller.until_next_reset();
                tokio::time::sleep(sleep_for).await;
                if let Err(e) = controller.repo.reset_window(BudgetWindow::Day).await {
                    tracing::warn!("daily budget reset failed: {e}");
                } else {
                    tracing::info!("daily budget windows reset");
                }
            }
        })
    }

    fn until_next_reset(&self) -> std::time::Duration {
        let now = Utc::now();
        let today_reset = now
            .date_naive()
            .and_hms_opt(self.config.daily_reset_hour.min(23), 0, 0)
            .unwrap_or_else(|| now.naive_utc());
        let next = if now.naive_utc() < today_reset {
            today_reset
        } else {
            today_reset + ChronoDuration::days(1)
        };
        (next - now.naive_utc())
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(3_600))
    }

    /// The scopes a single agent's usage lands on.
    fn scope_chain(agent_id: Uuid, team_id: Option<Uuid>) -> Vec<(BudgetScope, BudgetWindow)> {
        let mut scopes = vec![
            (BudgetScope::Agent(agent_id), BudgetWindow::Lifetime),
            (BudgetScope::Global, BudgetWindow::Day),
            (BudgetScope::Global, BudgetWindow::Lifetime),
        ];
        if let Some(team_id) = team_id {
            scopes.insert(1, (BudgetScope::Team(team_id), BudgetWindow::Lifetime));
        }
        scopes
    }

    const fn window_for(scope: &BudgetScope) -> BudgetWindow {
        match scope {
            BudgetScope::Global | BudgetScope::Project(_) => BudgetWindow::Day,
            _ => BudgetWindow::Lifetime,
        }
    }

    /// Walk each committed record through the warn/throttle ladder,
    /// emitting an event on each upward crossing.
    async fn evaluate_ladder(&self, records: &[BudgetRecord], usage: Usage) {
        for record in records {
            let Some(limit) = record.limit_cost else { continue };
            if limit <= 0.0 {
                continue;
            }
            let now_frac = record.cost_usd / limit;
            let prev_frac = (record.cost_usd - usage.cost_usd).max(0.0) / limit;
            let scope = record.scope.to_string();

            if prev_frac < self.config.throttle_pct && now_frac >= self.config.throttle_pct {
                tracing::warn!(%scope, fraction = now_frac, "budget throttle threshold crossed");
                self.bus
                    .publish(Event::new(
                        SOURCE,
                        EventPayload::BudgetThrottle { scope, consumed_fraction: now_frac },
                    ))
                    .await;
            } else if prev_frac < self.config.warn_pct && now_frac >= self.config.warn_pct {
                self.bus
                    .publish(Event::new(
                        SOURCE,
                        EventPayload::BudgetWarning { scope, consumed_fraction: now_frac },
                    ))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryBudgetRepository;
    use crate::domain::models::EventFilter;

    fn controller() -> (Arc<BudgetController>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let repo = Arc::new(InMemoryBudgetRepository::new());
        let controller = Arc::new(BudgetController::new(repo, bus.clone(), BudgetConfig::default()));
        (controller, bus)
    }

    #[tokio::test]
    async fn test_record_usage_prices_from_table() {
        let (controller, _bus) = controller();
        let usage = controller
            .record_usage(Uuid::new_v4(), None, "opus", 1_000_000, 0)
            .await
            .unwrap();
        assert!((usage.cost_usd - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_debit_lands_on_all_scopes() {
        let (controller, _bus) = controller();
        let agent = Uuid::new_v4();
        let team = Uuid::new_v4();
        controller
            .debit(agent, Some(team), Usage::new(100, 50, 0.01))
            .await
            .unwrap();

        let agent_rec = controller
            .get(&BudgetScope::Agent(agent), BudgetWindow::Lifetime)
            .await
            .unwrap()
            .unwrap();
        assert!((agent_rec.cost_usd - 0.01).abs() < 1e-9);

        let team_rec = controller
            .get(&BudgetScope::Team(team), BudgetWindow::Lifetime)
            .await
            .unwrap()
            .unwrap();
        assert!((team_rec.cost_usd - 0.01).abs() < 1e-9);

        let global_day = controller
            .get(&BudgetScope::Global, BudgetWindow::Day)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(global_day.tokens_in, 100);
    }

    #[tokio::test]
    async fn test_hard_limit_rejects_with_no_mutation() {
        let (controller, _bus) = controller();
        let agent = Uuid::new_v4();
        let team = Uuid::new_v4();
        controller
            .set_limit(&BudgetScope::Team(team), BudgetWindow::Lifetime, 0.01)
            .await
            .unwrap();

        controller.debit(agent, Some(team), Usage::new(1, 1, 0.008)).await.unwrap();
        let err = controller
            .debit(agent, Some(team), Usage::new(1, 1, 0.008))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BudgetDenied(_)));

        // The rejected debit left every counter untouched.
        let team_rec = controller
            .get(&BudgetScope::Team(team), BudgetWindow::Lifetime)
            .await
            .unwrap()
            .unwrap();
        assert!((team_rec.cost_usd - 0.008).abs() < 1e-9);
        assert!(team_rec.exhausted);
        let agent_rec = controller
            .get(&BudgetScope::Agent(agent), BudgetWindow::Lifetime)
            .await
            .unwrap()
            .unwrap();
        assert!((agent_rec.cost_usd - 0.008).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ladder_emits_throttle_then_exhausted() {
        let (controller, bus) = controller();
        let mut watch = bus
            .subscribe(
                "ladder",
                EventFilter::for_kinds(["budget_warning", "budget_throttle", "budget_exhausted"]),
            )
            .await;

        let agent = Uuid::new_v4();
        let team = Uuid::new_v4();
        controller
            .set_limit(&BudgetScope::Team(team), BudgetWindow::Lifetime, 0.01)
            .await
            .unwrap();

        // 3 x 0.003 = 90% -> warning then throttle on the way up.
        for _ in 0..3 {
            controller.debit(agent, Some(team), Usage::new(1, 1, 0.003)).await.unwrap();
        }
        // A 4th send would exceed the cap outright.
        let err = controller
            .debit(agent, Some(team), Usage::new(1, 1, 0.003))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BudgetDenied(_)));

        let mut kinds = Vec::new();
        while let Some(event) = watch.try_recv() {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&"budget_warning"));
        assert!(kinds.contains(&"budget_throttle"));
        assert!(kinds.contains(&"budget_exhausted"));
    }

    #[tokio::test]
    async fn test_spawn_denied_after_exhaustion() {
        let (controller, _bus) = controller();
        let team = Uuid::new_v4();
        controller
            .set_limit(&BudgetScope::Team(team), BudgetWindow::Lifetime, 0.005)
            .await
            .unwrap();
        let _ = controller
            .debit(Uuid::new_v4(), Some(team), Usage::new(1, 1, 0.01))
            .await;

        let err = controller
            .check_spawn_allowed(&BudgetScope::Team(team), 0.001)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BudgetDenied(_)));
    }

    #[tokio::test]
    async fn test_reset_clears_exhaustion() {
        let (controller, _bus) = controller();
        let team = Uuid::new_v4();
        controller
            .set_limit(&BudgetScope::Team(team), BudgetWindow::Lifetime, 0.001)
            .await
            .unwrap();
        let _ = controller
            .debit(Uuid::new_v4(), Some(team), Usage::new(1, 1, 0.01))
            .await;
        assert!(controller
            .check_spawn_allowed(&BudgetScope::Team(team), 0.0005)
            .await
            .is_err());

        controller.reset(&BudgetScope::Team(team), BudgetWindow::Lifetime).await.unwrap();
        assert!(controller
            .check_spawn_allowed(&BudgetScope::Team(team), 0.0005)
            .await
            .is_ok());
    }
}
