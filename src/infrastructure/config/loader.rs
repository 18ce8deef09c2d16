//! Hierarchical configuration loading.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrent_agents: {0}. Must be between 1 and 500")]
    InvalidMaxAgents(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid budget thresholds: warn {warn} <= throttle {throttle} <= hard {hard} required")]
    InvalidBudgetLadder { warn: f64, throttle: f64, hard: f64 },

    #[error("Invalid retry backoff: base {0}ms must be less than cap {1}ms")]
    InvalidBackoff(u64, u64),

    #[error("Invalid daily reset hour: {0}. Must be 0-23")]
    InvalidResetHour(u32),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.drover/config.yaml` (project config)
    /// 3. `.drover/local.yaml` (local overrides, optional)
    /// 4. `DROVER_*` environment variables
    /// 5. The contractual env vars (`GATEWAY_URL`, `GATEWAY_TOKEN`,
    ///    `DB_PATH`, `DATA_DIR`, `MAX_CONCURRENT_AGENTS`,
    ///    `GLOBAL_DAILY_COST_CAP`)
    pub fn load() -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".drover/config.yaml"))
            .merge(Yaml::file(".drover/local.yaml"))
            .merge(Env::prefixed("DROVER_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::apply_contract_env(&mut config)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from a single file plus defaults. Contract env vars still win.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::apply_contract_env(&mut config)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// The environment variables the core is contractually required to
    /// honor, independent of the `DROVER_` prefix scheme.
    fn apply_contract_env(config: &mut Config) -> Result<()> {
        if let Ok(url) = std::env::var("GATEWAY_URL") {
            config.gateway.url = url;
        }
        if let Ok(token) = std::env::var("GATEWAY_TOKEN") {
            config.gateway.token = token;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            config.database.path = path;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.limits.data_dir = dir;
        }
        if let Ok(max) = std::env::var("MAX_CONCURRENT_AGENTS") {
            config.limits.max_concurrent_agents =
                max.parse().context("MAX_CONCURRENT_AGENTS must be an integer")?;
        }
        if let Ok(cap) = std::env::var("GLOBAL_DAILY_COST_CAP") {
            config.limits.global_daily_cost_cap =
                cap.parse().context("GLOBAL_DAILY_COST_CAP must be a number")?;
        }
        Ok(())
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.limits.max_concurrent_agents == 0 || config.limits.max_concurrent_agents > 500 {
            return Err(ConfigError::InvalidMaxAgents(config.limits.max_concurrent_agents));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let budget = &config.budget;
        if !(budget.warn_pct <= budget.throttle_pct
            && budget.throttle_pct <= budget.hard_pct
            && budget.warn_pct > 0.0)
        {
            return Err(ConfigError::InvalidBudgetLadder {
                warn: budget.warn_pct,
                throttle: budget.throttle_pct,
                hard: budget.hard_pct,
            });
        }
        if budget.daily_reset_hour > 23 {
            return Err(ConfigError::InvalidResetHour(budget.daily_reset_hour));
        }

        if config.retry.base_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.base_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        if config.improvement.enabled && config.improvement.scope_allowlist.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "improvement loop requires a non-empty scope_allowlist".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.limits.max_concurrent_agents, 20);
        assert_eq!(config.database.path, ".drover/drover.db");
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("default config should validate");
    }

    #[test]
    fn test_yaml_parsing_and_merge() {
        let yaml = r"
limits:
  max_concurrent_agents: 40
  global_daily_cost_cap: 12.5
budget:
  warn_pct: 0.5
  throttle_pct: 0.8
  hard_pct: 1.0
gateway:
  url: ws://gateway.internal:9000/ws
";
        let config: Config = serde_yaml::from_str(yaml).expect("yaml should parse");
        assert_eq!(config.limits.max_concurrent_agents, 40);
        assert!((config.limits.global_daily_cost_cap - 12.5).abs() < f64::EPSILON);
        assert_eq!(config.gateway.url, "ws://gateway.internal:9000/ws");
        // Untouched sections keep their defaults.
        assert_eq!(config.database.path, ".drover/drover.db");
        ConfigLoader::validate(&config).expect("parsed config should validate");
    }

    #[test]
    fn test_validate_rejects_zero_agents() {
        let mut config = Config::default();
        config.limits.max_concurrent_agents = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxAgents(0))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_ladder() {
        let mut config = Config::default();
        config.budget.warn_pct = 0.95;
        config.budget.throttle_pct = 0.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBudgetLadder { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = Config::default();
        config.retry.base_backoff_ms = 60_000;
        config.retry.max_backoff_ms = 1_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(60_000, 1_000))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "limits:\n  max_concurrent_agents: 5\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(
            override_file,
            "limits:\n  max_concurrent_agents: 15\nlogging:\n  level: debug"
        )
        .unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.limits.max_concurrent_agents, 15, "override should win");
        assert_eq!(config.logging.level, "debug", "override should win for nested fields");
        assert_eq!(config.logging.format, "json", "base value persists when not overridden");
    }

    #[test]
    fn test_improvement_requires_allowlist() {
        let mut config = Config::default();
        config.improvement.enabled = true;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ValidationFailed(_))
        ));
        config.improvement.scope_allowlist = vec!["src/**".to_string()];
        assert!(ConfigLoader::validate(&config).is_ok());
    }
}
