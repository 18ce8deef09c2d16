//! Budget scopes, windows, and usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bucket of token and cost counters with associated limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope_type", content = "scope_id", rename_all = "snake_case")]
pub enum BudgetScope {
    Agent(Uuid),
    Team(Uuid),
    Project(String),
    Global,
}

impl BudgetScope {
    pub fn scope_type(&self) -> &'static str {
        match self {
            Self::Agent(_) => "agent",
            Self::Team(_) => "team",
            Self::Project(_) => "project",
            Self::Global => "global",
        }
    }

    pub fn scope_id(&self) -> String {
        match self {
            Self::Agent(id) | Self::Team(id) => id.to_string(),
            Self::Project(name) => name.clone(),
            Self::Global => "global".to_string(),
        }
    }
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope_type(), self.scope_id())
    }
}

/// Accounting window for a budget record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    /// Resets at the configured wall-clock hour each day.
    Day,
    /// Never resets.
    Lifetime,
}

impl BudgetWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Lifetime => "lifetime",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Some(Self::Day),
            "lifetime" => Some(Self::Lifetime),
            _ => None,
        }
    }
}

/// Raw usage reported for one unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(tokens_in: u64, tokens_out: u64, cost_usd: f64) -> Self {
        Self { tokens_in, tokens_out, cost_usd }
    }
}

/// One persisted counter row: a scope in a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub scope: BudgetScope,
    pub window: BudgetWindow,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    /// Hard cost ceiling, if any.
    pub limit_cost: Option<f64>,
    /// Set once the hard threshold is hit; spawns in this scope are denied.
    #[serde(default)]
    pub exhausted: bool,
    pub last_updated: DateTime<Utc>,
}

impl BudgetRecord {
    pub fn new(scope: BudgetScope, window: BudgetWindow) -> Self {
        Self {
            scope,
            window,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            limit_cost: None,
            exhausted: false,
            last_updated: Utc::now(),
        }
    }

    pub fn with_limit(mut self, limit_cost: f64) -> Self {
        self.limit_cost = Some(limit_cost);
        self
    }

    /// Fraction of the cost limit consumed, if a limit is set.
    pub fn consumed_fraction(&self) -> Option<f64> {
        self.limit_cost.map(|limit| {
            if limit <= 0.0 {
                1.0
            } else {
                self.cost_usd / limit
            }
        })
    }

    /// Whether adding `cost` would push this record past its limit.
    pub fn would_exceed(&self, cost: f64) -> bool {
        match self.limit_cost {
            Some(limit) => self.cost_usd + cost > limit + f64::EPSILON,
            None => false,
        }
    }

    pub fn apply(&mut self, usage: Usage) {
        self.tokens_in += usage.tokens_in;
        self.tokens_out += usage.tokens_out;
        self.cost_usd += usage.cost_usd;
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        let id = Uuid::new_v4();
        assert_eq!(BudgetScope::Agent(id).to_string(), format!("agent:{id}"));
        assert_eq!(BudgetScope::Global.to_string(), "global:global");
        assert_eq!(
            BudgetScope::Project("improvement".into()).to_string(),
            "project:improvement"
        );
    }

    #[test]
    fn test_would_exceed() {
        let mut record = BudgetRecord::new(BudgetScope::Global, BudgetWindow::Day).with_limit(1.0);
        record.apply(Usage::new(10, 20, 0.9));
        assert!(!record.would_exceed(0.05));
        assert!(record.would_exceed(0.2));
    }

    #[test]
    fn test_no_limit_never_exceeds() {
        let record = BudgetRecord::new(BudgetScope::Global, BudgetWindow::Lifetime);
        assert!(!record.would_exceed(1e9));
        assert_eq!(record.consumed_fraction(), None);
    }

    #[test]
    fn test_apply_accumulates() {
        let mut record = BudgetRecord::new(BudgetScope::Global, BudgetWindow::Day);
        record.apply(Usage::new(100, 50, 0.01));
        record.apply(Usage::new(10, 5, 0.002));
        assert_eq!(record.tokens_in, 110);
        assert_eq!(record.tokens_out, 55);
        assert!((record.cost_usd - 0.012).abs() < 1e-9);
    }

    #[test]
    fn test_window_parse() {
        assert_eq!(BudgetWindow::parse_str("daily"), Some(BudgetWindow::Day));
        assert_eq!(BudgetWindow::parse_str("lifetime"), Some(BudgetWindow::Lifetime));
        assert_eq!(BudgetWindow::parse_str("hourly"), None);
    }
}
