//! Configuration model.
//!
//! The full tree is deserialized by the figment loader in
//! `infrastructure::config`; defaults here are the programmatic base layer.

use serde::{Deserialize, Serialize};

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub improvement: ImprovementConfig,
}

/// Global safety ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hard cap on live agents across all teams.
    pub max_concurrent_agents: usize,
    /// Hard daily cost cap for the whole process, USD.
    pub global_daily_cost_cap: f64,
    /// Root directory for workspaces and logs.
    pub data_dir: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 20,
            global_daily_cost_cap: 50.0,
            data_dir: ".drover".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".drover/drover.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// json or pretty
    pub format: String,
    /// Directory for rolling log files; stdout-only when unset.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    pub client_id: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Seconds allowed for the initial dial.
    pub dial_timeout_secs: u64,
    /// Default control-call timeout, seconds.
    pub rpc_timeout_secs: u64,
    /// RPCs queued while reconnecting before calls fail fast.
    pub reconnect_queue_depth: usize,
    /// Reconnect backoff floor, milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect backoff cap, milliseconds.
    pub reconnect_cap_ms: u64,
    /// Give up after this many consecutive reconnect failures. 0 = never.
    pub max_reconnect_attempts: u32,
}

fn default_scopes() -> Vec<String> {
    vec!["sessions".to_string(), "events".to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7433/gateway".to_string(),
            token: String::new(),
            client_id: "drover".to_string(),
            scopes: default_scopes(),
            dial_timeout_secs: 10,
            rpc_timeout_secs: 30,
            reconnect_queue_depth: 64,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 0,
        }
    }
}

/// Thresholds for the budget policy ladder, as fractions of a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub warn_pct: f64,
    pub throttle_pct: f64,
    pub hard_pct: f64,
    /// Wall-clock hour (0-23, local) at which daily windows reset.
    pub daily_reset_hour: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warn_pct: 0.75,
            throttle_pct: 0.90,
            hard_pct: 1.0,
            daily_reset_hour: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Symmetric jitter applied to each delay, as a fraction.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter: 0.25,
        }
    }
}

/// Local runtime provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Which provider executes agents: local, gateway, or mock.
    pub provider: String,
    /// Agent command for the local provider.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            command: "agent-worker".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum depth of the parent/child spawn tree.
    pub max_tree_depth: u32,
    /// Minimum seconds between autoscaling changes per team.
    pub autoscale_min_interval_secs: u64,
    /// Sustained low-utilization window before scale-down, seconds.
    pub autoscale_low_watermark_secs: u64,
    /// Projected completion threshold that triggers scale-up, seconds.
    pub autoscale_target_completion_secs: u64,
    /// Seconds running agents get to finish during graceful shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tree_depth: 4,
            autoscale_min_interval_secs: 30,
            autoscale_low_watermark_secs: 120,
            autoscale_target_completion_secs: 600,
            shutdown_grace_secs: 30,
        }
    }
}

/// Auto-improvement loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Budget cap per improvement cycle, USD.
    pub cycle_cost_cap: f64,
    /// Daily ceiling for all improvement teams, USD.
    pub daily_cost_cap: f64,
    /// Paths improvement tasks may touch.
    #[serde(default)]
    pub scope_allowlist: Vec<String>,
    /// Fraction of failed agents in the window that trips the check.
    pub failed_fraction_threshold: f64,
    /// Dropped bus events in the window that trips the check.
    pub bus_drop_threshold: u64,
    /// Fraction of the daily cap burned that trips the check.
    pub burn_rate_threshold: f64,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 900,
            cycle_cost_cap: 0.50,
            daily_cost_cap: 5.0,
            scope_allowlist: Vec::new(),
            failed_fraction_threshold: 0.25,
            bus_drop_threshold: 100,
            burn_rate_threshold: 0.80,
        }
    }
}
