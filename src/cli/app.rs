//! Process object graph.
//!
//! The core is assembled explicitly at startup; tests build their own
//! graph over the in-memory store, the CLI builds this one over SQLite.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::adapters::runtime::{GatewayRuntime, LocalProcessRuntime, MockRuntime};
use crate::adapters::sqlite::{
    all_embedded_migrations, open_store, Migrator, SqliteAgentRepository, SqliteBudgetRepository,
    SqliteEventRepository, SqliteTeamRepository,
};
use crate::domain::models::Config;
use crate::domain::ports::{AgentRepository, EventRepository, RuntimeProvider};
use crate::infrastructure::gateway::GatewayClient;
use crate::services::{
    BudgetController, EventBus, EventBusConfig, ImprovementLoop, LifecycleConfig,
    LifecycleManager, RetryPolicy, TeamOrchestrator,
};

/// The assembled core.
pub struct CoreGraph {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub events: Arc<dyn EventRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub budget: Arc<BudgetController>,
    pub lifecycle: Arc<LifecycleManager>,
    pub orchestrator: Arc<TeamOrchestrator>,
    pub improvement: Option<Arc<ImprovementLoop>>,
    pub gateway: Option<Arc<GatewayClient>>,
}

impl CoreGraph {
    /// Open the store, run migrations, and wire every component.
    pub async fn assemble(config: Config) -> Result<Self> {
        let pool = open_store(&config.database)
            .await
            .context("failed to open the state store")?;
        Migrator::new(pool.clone())
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .context("failed to run migrations")?;

        let events: Arc<dyn EventRepository> = Arc::new(SqliteEventRepository::new(pool.clone()));
        let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool.clone()));
        let teams = Arc::new(SqliteTeamRepository::new(pool.clone()));
        let budgets = Arc::new(SqliteBudgetRepository::new(pool));

        let bus = Arc::new(EventBus::new(EventBusConfig::default()).with_store(events.clone()));
        bus.initialize_seq_from_store().await;

        let budget =
            Arc::new(BudgetController::new(budgets, bus.clone(), config.budget.clone()));
        budget
            .set_global_daily_cap(config.limits.global_daily_cost_cap)
            .await
            .context("failed to install the global daily cap")?;

        let mut gateway = None;
        let runtime: Arc<dyn RuntimeProvider> = match config.runtime.provider.as_str() {
            "gateway" => {
                let client = GatewayClient::new(config.gateway.clone(), bus.clone());
                let runtime = GatewayRuntime::new(client.clone());
                gateway = Some(client);
                runtime
            }
            "mock" => Arc::new(MockRuntime::new()),
            _ => Arc::new(LocalProcessRuntime::new(
                config.runtime.clone(),
                std::env::current_dir().context("cannot resolve working directory")?,
                &config.limits.data_dir,
            )),
        };

        let lifecycle = LifecycleManager::new(
            agents.clone(),
            runtime,
            bus.clone(),
            budget.clone(),
            LifecycleConfig {
                max_concurrent_agents: config.limits.max_concurrent_agents,
                retry: RetryPolicy {
                    max_retries: config.retry.max_retries,
                    base_ms: config.retry.base_backoff_ms,
                    cap_ms: config.retry.max_backoff_ms,
                    jitter: config.retry.jitter,
                },
                max_tree_depth: config.orchestrator.max_tree_depth,
                ..Default::default()
            },
        );

        let orchestrator = TeamOrchestrator::new(
            teams,
            agents.clone(),
            lifecycle.clone(),
            budget.clone(),
            bus.clone(),
            config.orchestrator.clone(),
        );

        let improvement = if config.improvement.enabled {
            Some(ImprovementLoop::new(
                orchestrator.clone(),
                agents.clone(),
                budget.clone(),
                bus.clone(),
                config.improvement.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            bus,
            events,
            agents,
            budget,
            lifecycle,
            orchestrator,
            improvement,
            gateway,
        })
    }

    /// Start background machinery: lifecycle, orchestrator, gateway,
    /// budget reset scheduler, and the improvement loop when enabled.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.start().await;
        self.orchestrator.start().await;
        self.budget.clone().spawn_daily_reset();
        if let Some(gateway) = &self.gateway {
            let _ = gateway.connect();
        }
        if let Some(improvement) = &self.improvement {
            improvement.start().await.context("failed to start the improvement loop")?;
        }
        Ok(())
    }
}
