//! Agent lifecycle manager.
//!
//! The single writer of agent state. Every mutation happens inside the
//! agent's critical section, is persisted together with its event row,
//! and only then is the event published, so subscribers never observe an
//! event that crash recovery would contradict.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    Agent, AgentState, BudgetScope, BudgetWindow, Event, EventPayload, SafetyBoundaries, TaskSpec,
};
use crate::domain::ports::{AgentFilter, AgentRepository, RuntimeProvider, SpawnSpec};
use crate::services::backoff::RetryPolicy;
use crate::services::budget::BudgetController;
use crate::services::event_bus::EventBus;

const SOURCE: &str = "lifecycle";

/// Tunables for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Global cap on live agents.
    pub max_concurrent_agents: usize,
    /// Spawn/send retry policy.
    pub retry: RetryPolicy,
    /// Maximum depth of the parent/child spawn tree.
    pub max_tree_depth: u32,
    /// Kill-reaper retry cap before an `orphan_session` is emitted.
    pub reaper_max_attempts: u32,
    /// Delay between reaper attempts.
    pub reaper_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 20,
            retry: RetryPolicy::default(),
            max_tree_depth: 4,
            reaper_max_attempts: 5,
            reaper_interval: Duration::from_secs(5),
        }
    }
}

/// Options accompanying a spawn request.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub label: Option<String>,
    pub model: Option<String>,
    pub team_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub task_spec: Option<TaskSpec>,
    pub budget_limit: Option<f64>,
    pub max_retries: Option<u32>,
    pub safety: Option<SafetyBoundaries>,
    /// Shared team context handed to the runtime at spawn.
    pub context: Vec<(String, String)>,
}

struct ReapRequest {
    agent_id: Uuid,
    session_key: String,
    attempts: u32,
}

/// Owns the state machine for every agent.
pub struct LifecycleManager {
    /// Self-handle for launching driver tasks; set at construction.
    me: Weak<LifecycleManager>,
    agents: Arc<dyn AgentRepository>,
    runtime: Arc<dyn RuntimeProvider>,
    bus: Arc<EventBus>,
    budget: Arc<BudgetController>,
    config: LifecycleConfig,
    started: AtomicBool,
    accepting: AtomicBool,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// Spawn-time context, kept off the persisted record.
    contexts: std::sync::Mutex<HashMap<Uuid, Vec<(String, String)>>>,
    /// Dispatch instants for runtime_ms accounting.
    running_since: std::sync::Mutex<HashMap<Uuid, Instant>>,
    reap_tx: mpsc::UnboundedSender<ReapRequest>,
    reap_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<ReapRequest>>>,
}

impl LifecycleManager {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        runtime: Arc<dyn RuntimeProvider>,
        bus: Arc<EventBus>,
        budget: Arc<BudgetController>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            agents,
            runtime,
            bus,
            budget,
            config,
            started: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            locks: std::sync::Mutex::new(HashMap::new()),
            contexts: std::sync::Mutex::new(HashMap::new()),
            running_since: std::sync::Mutex::new(HashMap::new()),
            reap_tx,
            reap_rx: AsyncMutex::new(Some(reap_rx)),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    /// Start background machinery. Spawns are rejected until this runs.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(rx) = self.reap_rx.lock().await.take() {
            if let Some(manager) = self.strong() {
                tokio::spawn(async move { manager.run_reaper(rx).await });
            }
        }
        tracing::info!(runtime = self.runtime.name(), "lifecycle manager started");
    }

    // -------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------

    /// Allocate an agent, persist it in `spawning`, and submit the spawn
    /// to the runtime provider. Returns before the session is ready.
    pub async fn spawn(
        &self,
        task: impl Into<String>,
        options: SpawnOptions,
    ) -> CoreResult<Uuid> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(CoreError::InvalidInput("lifecycle manager not started".into()));
        }
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CoreError::InvalidInput("lifecycle manager is shutting down".into()));
        }

        let live = self.agents.count_live().await?;
        if live as usize >= self.config.max_concurrent_agents {
            return Err(CoreError::CapacityExceeded(format!(
                "{live} live agents at the configured cap of {}",
                self.config.max_concurrent_agents
            )));
        }

        let mut agent = Agent::new(task, options.model.as_deref().unwrap_or("sonnet"));
        if let Some(label) = options.label {
            agent = agent.with_label(label);
        }
        if let Some(team_id) = options.team_id {
            agent = agent.with_team(team_id);
        }
        if let Some(spec) = options.task_spec {
            agent = agent.with_task_spec(spec);
        }
        if let Some(limit) = options.budget_limit {
            agent = agent.with_budget_limit(limit);
        }
        if let Some(max) = options.max_retries {
            agent = agent.with_max_retries(max);
        }
        if let Some(safety) = options.safety {
            agent = agent.with_safety(safety);
        }

        if let Some(parent_id) = options.parent_id {
            self.check_ancestry(parent_id, agent.budget_limit).await?;
            agent = agent.with_parent(parent_id);
        }
        if let Some(team_id) = agent.team_id {
            self.budget
                .check_spawn_allowed(&BudgetScope::Team(team_id), agent.budget_limit)
                .await?;
        }
        self.budget
            .check_spawn_allowed(&BudgetScope::Global, agent.budget_limit)
            .await?;

        if !options.context.is_empty() {
            self.contexts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(agent.id, options.context);
        }

        // The spawning row and its event commit together; only then does
        // the event reach subscribers.
        let mut event = Event::new(SOURCE, EventPayload::AgentSpawning { attempt: 0 })
            .for_agent(agent.id)
            .maybe_team(agent.team_id);
        event.seq = self.bus.allocate_seq();
        self.agents.persist_transition(&agent, &event).await?;
        self.bus.publish_stamped(event).await;

        let agent_id = agent.id;
        if let Some(manager) = self.strong() {
            tokio::spawn(async move { manager.drive_spawn(agent_id).await });
        }

        Ok(agent_id)
    }

    /// Dispatch a message to an idle agent. Transitions to `running` and
    /// returns; the result is handled asynchronously.
    pub async fn send(&self, agent_id: Uuid, message: impl Into<String>) -> CoreResult<()> {
        let message = message.into();
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut agent = self.load(agent_id).await?;
        if agent.state != AgentState::Idle {
            return Err(invalid_state(&agent, "send"));
        }
        let Some(session_key) = agent.session_key.clone() else {
            return Err(CoreError::internal(std::io::Error::other(format!(
                "idle agent {agent_id} holds no session"
            ))));
        };

        self.apply_transition(&mut agent, AgentState::Running, EventPayload::AgentRunning {})
            .await?;
        self.running_since
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(agent_id, Instant::now());
        drop(_guard);

        if let Some(manager) = self.strong() {
            tokio::spawn(async move { manager.drive_send(agent_id, session_key, message).await });
        }
        Ok(())
    }

    /// Pause a running agent. Pausing a paused agent is a no-op.
    pub async fn pause(&self, agent_id: Uuid) -> CoreResult<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let mut agent = self.load(agent_id).await?;
        match agent.state {
            AgentState::Paused => Ok(()),
            AgentState::Running => {
                agent.pause_time = Some(chrono::Utc::now());
                self.apply_transition(&mut agent, AgentState::Paused, EventPayload::AgentPaused {})
                    .await
            }
            _ => Err(invalid_state(&agent, "pause")),
        }
    }

    /// Resume a paused agent back to `idle`. Resuming an idle agent is a
    /// no-op.
    pub async fn resume(&self, agent_id: Uuid) -> CoreResult<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let mut agent = self.load(agent_id).await?;
        match agent.state {
            AgentState::Idle => Ok(()),
            AgentState::Paused => {
                agent.pause_time = None;
                self.apply_transition(&mut agent, AgentState::Idle, EventPayload::AgentResumed {})
                    .await
            }
            _ => Err(invalid_state(&agent, "resume")),
        }
    }

    /// Kill an agent. Idempotent: killing a terminal agent succeeds with
    /// no second state change and no duplicate event.
    pub async fn kill(&self, agent_id: Uuid, reason: &str) -> CoreResult<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let mut agent = self.load(agent_id).await?;
        if agent.state.is_terminal() {
            return Ok(());
        }
        let session_key = agent.session_key.clone();
        self.apply_transition(
            &mut agent,
            AgentState::Killed,
            EventPayload::AgentKilled { reason: reason.to_string() },
        )
        .await?;
        drop(_guard);

        if let Some(session_key) = session_key {
            self.reap_session(agent_id, session_key).await;
        }
        Ok(())
    }

    /// Kill several agents, acquiring locks in ascending id order.
    pub async fn kill_many(&self, mut agent_ids: Vec<Uuid>, reason: &str) -> CoreResult<()> {
        agent_ids.sort();
        agent_ids.dedup();
        for agent_id in agent_ids {
            match self.kill(agent_id, reason).await {
                Ok(()) | Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Re-enter `spawning` from `failed`, if retries remain.
    pub async fn retry(&self, agent_id: Uuid) -> CoreResult<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let mut agent = self.load(agent_id).await?;
        if agent.state != AgentState::Failed {
            return Err(invalid_state(&agent, "retry"));
        }
        if !agent.can_retry() {
            return Err(CoreError::InvalidInput(format!(
                "agent {agent_id} has exhausted its {} retries",
                agent.max_retries
            )));
        }
        agent.session_key = None;
        let attempt = agent.retry_count;
        self.apply_transition(
            &mut agent,
            AgentState::Spawning,
            EventPayload::AgentSpawning { attempt },
        )
        .await?;
        drop(_guard);

        if let Some(manager) = self.strong() {
            tokio::spawn(async move { manager.drive_spawn(agent_id).await });
        }
        Ok(())
    }

    pub async fn get(&self, agent_id: Uuid) -> CoreResult<Agent> {
        self.load(agent_id).await
    }

    pub async fn list(&self, filter: AgentFilter) -> CoreResult<Vec<Agent>> {
        self.agents.list(filter).await
    }

    /// Graceful shutdown: stop accepting spawns, give running agents a
    /// grace window, then force-kill whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> CoreResult<()> {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.agents.count_live().await? == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let live = self.agents.list(AgentFilter::default()).await?;
        let ids: Vec<Uuid> = live.iter().filter(|a| a.state.is_live()).map(|a| a.id).collect();
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "force-killing agents at shutdown deadline");
            self.kill_many(ids, "shutdown").await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Drivers
    // -------------------------------------------------------------------

    /// Drive one agent from `spawning` to `idle`, retrying transient
    /// spawn failures under the backoff policy.
    async fn drive_spawn(&self, agent_id: Uuid) {
        loop {
            let Ok(agent) = self.load(agent_id).await else { return };
            if agent.state != AgentState::Spawning {
                return;
            }
            let spec = self.spawn_spec(&agent);

            match self.runtime.spawn(spec).await {
                Ok(session_key) => {
                    let lock = self.lock_for(agent_id);
                    let _guard = lock.lock().await;
                    let Ok(mut agent) = self.load(agent_id).await else { return };
                    match agent.state {
                        AgentState::Spawning => {
                            agent.session_key = Some(session_key.clone());
                            let payload = EventPayload::AgentReady { session_key };
                            if let Err(e) =
                                self.apply_transition(&mut agent, AgentState::Idle, payload).await
                            {
                                tracing::error!(%agent_id, "failed to persist agent_ready: {e}");
                            }
                        }
                        // Killed while the spawn was in flight: release the
                        // session we just acquired.
                        _ => {
                            drop(_guard);
                            self.reap_session(agent_id, session_key).await;
                        }
                    }
                    return;
                }
                Err(e) if e.is_transient() => {
                    let lock = self.lock_for(agent_id);
                    let _guard = lock.lock().await;
                    let Ok(mut agent) = self.load(agent_id).await else { return };
                    if agent.state != AgentState::Spawning {
                        return;
                    }
                    if !agent.can_retry() {
                        agent.last_error = Some(e.to_string());
                        let payload = EventPayload::AgentFailed {
                            error: e.to_string(),
                            retry_count: agent.retry_count,
                        };
                        let _ = self.apply_transition(&mut agent, AgentState::Failed, payload).await;
                        return;
                    }
                    agent.retry_count += 1;
                    agent.last_error = Some(e.to_string());
                    let delay = self.config.retry.delay(agent.retry_count - 1);
                    let payload = EventPayload::AgentRetrying {
                        attempt: agent.retry_count,
                        max_attempts: agent.max_retries,
                        delay_ms: delay.as_millis() as u64,
                    };
                    if self
                        .apply_transition(&mut agent, AgentState::Spawning, payload)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    drop(_guard);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let lock = self.lock_for(agent_id);
                    let _guard = lock.lock().await;
                    let Ok(mut agent) = self.load(agent_id).await else { return };
                    if agent.state != AgentState::Spawning {
                        return;
                    }
                    agent.last_error = Some(e.to_string());
                    let payload = EventPayload::AgentFailed {
                        error: e.to_string(),
                        retry_count: agent.retry_count,
                    };
                    let _ = self.apply_transition(&mut agent, AgentState::Failed, payload).await;
                    return;
                }
            }
        }
    }

    /// Await one message round-trip and settle the agent.
    async fn drive_send(&self, agent_id: Uuid, session_key: String, message: String) {
        let result = self.runtime.send(&session_key, &message).await;
        let elapsed_ms = self
            .running_since
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&agent_id)
            .map_or(0, |since| since.elapsed().as_millis() as u64);

        match result {
            Ok(run) => {
                let Ok(agent) = self.load(agent_id).await else { return };
                let debit = self
                    .budget
                    .record_usage(agent_id, agent.team_id, &agent.model, run.tokens_in, run.tokens_out)
                    .await;

                let lock = self.lock_for(agent_id);
                let _guard = lock.lock().await;
                let Ok(mut agent) = self.load(agent_id).await else { return };
                if agent.state != AgentState::Running {
                    return;
                }
                agent.runtime_ms += elapsed_ms;

                match debit {
                    Ok(usage) => {
                        let payload = EventPayload::AgentCompleted {
                            tokens_in: usage.tokens_in,
                            tokens_out: usage.tokens_out,
                            cost_usd: usage.cost_usd,
                        };
                        // The result text rides along as an additive field
                        // so pipeline/reduce consumers can chain it.
                        let mut extra = std::collections::BTreeMap::new();
                        extra.insert("output".to_string(), serde_json::Value::String(run.output));
                        let _ = self
                            .apply_transition_with_extra(
                                &mut agent,
                                AgentState::Completed,
                                payload,
                                extra,
                            )
                            .await;
                    }
                    Err(CoreError::BudgetDenied(_)) => {
                        // The work happened but the scope is out of budget:
                        // the agent stops here.
                        let payload =
                            EventPayload::AgentKilled { reason: "budget_exhausted".to_string() };
                        let _ = self.apply_transition(&mut agent, AgentState::Killed, payload).await;
                        drop(_guard);
                        self.reap_session(agent_id, session_key).await;
                    }
                    Err(e) => {
                        tracing::error!(%agent_id, "usage debit failed: {e}");
                        agent.last_error = Some("internal".to_string());
                        let payload = EventPayload::AgentFailed {
                            error: "internal".to_string(),
                            retry_count: agent.retry_count,
                        };
                        let _ = self.apply_transition(&mut agent, AgentState::Failed, payload).await;
                    }
                }
            }
            Err(e) if e.is_transient() => {
                let lock = self.lock_for(agent_id);
                let _guard = lock.lock().await;
                let Ok(mut agent) = self.load(agent_id).await else { return };
                if agent.state != AgentState::Running {
                    return;
                }
                if agent.can_retry() {
                    agent.retry_count += 1;
                    agent.last_error = Some(e.to_string());
                    agent.session_key = None;
                    let delay = self.config.retry.delay(agent.retry_count - 1);
                    let payload = EventPayload::AgentRetrying {
                        attempt: agent.retry_count,
                        max_attempts: agent.max_retries,
                        delay_ms: delay.as_millis() as u64,
                    };
                    if self
                        .apply_transition(&mut agent, AgentState::Spawning, payload)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    drop(_guard);
                    self.reap_session(agent_id, session_key).await;
                    tokio::time::sleep(delay).await;
                    self.drive_spawn(agent_id).await;
                } else {
                    agent.last_error = Some(e.to_string());
                    let payload = EventPayload::AgentFailed {
                        error: e.to_string(),
                        retry_count: agent.retry_count,
                    };
                    let _ = self.apply_transition(&mut agent, AgentState::Failed, payload).await;
                }
            }
            Err(e) => {
                let lock = self.lock_for(agent_id);
                let _guard = lock.lock().await;
                let Ok(mut agent) = self.load(agent_id).await else { return };
                if agent.state != AgentState::Running {
                    return;
                }
                agent.last_error = Some(e.to_string());
                let payload =
                    EventPayload::AgentFailed { error: e.to_string(), retry_count: agent.retry_count };
                let _ = self.apply_transition(&mut agent, AgentState::Failed, payload).await;
            }
        }
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    fn lock_for(&self, agent_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(agent_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn load(&self, agent_id: Uuid) -> CoreResult<Agent> {
        self.agents
            .get(agent_id)
            .await?
            .ok_or_else(|| CoreError::agent_not_found(agent_id))
    }

    fn spawn_spec(&self, agent: &Agent) -> SpawnSpec {
        let context = self
            .contexts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&agent.id)
            .cloned()
            .unwrap_or_default();
        SpawnSpec {
            agent_id: agent.id.to_string(),
            model: agent.model.clone(),
            task: agent.task.clone(),
            task_spec: agent.task_spec.clone(),
            safety: agent.safety.clone(),
            context,
        }
    }

    /// Verify the parent chain: parent exists and is live, no cycles, tree
    /// depth within bounds, and the child's budget fits what the parent
    /// has left.
    async fn check_ancestry(&self, parent_id: Uuid, child_budget: f64) -> CoreResult<()> {
        let mut seen = vec![parent_id];
        let parent = self
            .agents
            .get(parent_id)
            .await?
            .ok_or_else(|| CoreError::agent_not_found(parent_id))?;
        if parent.state.is_terminal() {
            return Err(invalid_state(&parent, "spawn_child"));
        }

        let parent_spent = self
            .budget
            .get(&BudgetScope::Agent(parent_id), BudgetWindow::Lifetime)
            .await?
            .map_or(0.0, |r| r.cost_usd);
        let parent_remaining = (parent.budget_limit - parent_spent).max(0.0);
        if child_budget > parent_remaining + f64::EPSILON {
            return Err(CoreError::BudgetDenied(format!(
                "child budget {child_budget:.4} exceeds parent remainder {parent_remaining:.4}"
            )));
        }

        let mut depth = 1u32;
        let mut cursor = parent.parent_id;
        while let Some(ancestor_id) = cursor {
            if seen.contains(&ancestor_id) {
                return Err(CoreError::InvalidInput(format!(
                    "spawn would create a cycle through {ancestor_id}"
                )));
            }
            seen.push(ancestor_id);
            depth += 1;
            cursor = self.agents.get(ancestor_id).await?.and_then(|a| a.parent_id);
        }
        if depth >= self.config.max_tree_depth {
            return Err(CoreError::CapacityExceeded(format!(
                "spawn tree depth {depth} at the configured cap of {}",
                self.config.max_tree_depth
            )));
        }
        Ok(())
    }

    /// Validate, persist, and publish one transition. Must be called with
    /// the agent's lock held.
    async fn apply_transition(
        &self,
        agent: &mut Agent,
        next: AgentState,
        payload: EventPayload,
    ) -> CoreResult<()> {
        self.apply_transition_with_extra(agent, next, payload, std::collections::BTreeMap::new())
            .await
    }

    async fn apply_transition_with_extra(
        &self,
        agent: &mut Agent,
        next: AgentState,
        payload: EventPayload,
        extra: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> CoreResult<()> {
        if !agent.state.can_transition_to(next) {
            return Err(CoreError::internal(std::io::Error::other(format!(
                "illegal transition {} -> {} for agent {}",
                agent.state, next, agent.id
            ))));
        }
        agent.state = next;
        if next.is_terminal() {
            agent.completed_at = Some(chrono::Utc::now());
            self.contexts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&agent.id);
            self.running_since
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&agent.id);
        }

        let mut event = Event::new(SOURCE, payload).for_agent(agent.id).maybe_team(agent.team_id);
        event.extra = extra;
        event.seq = self.bus.allocate_seq();
        if let Err(e) = self.agents.persist_transition(agent, &event).await {
            // The store refused the write: force the agent to a safe
            // terminal state so the single-state invariant holds.
            tracing::error!(agent_id = %agent.id, "transition persistence failed: {e}");
            agent.state = AgentState::Failed;
            agent.last_error = Some("internal".to_string());
            agent.completed_at = Some(chrono::Utc::now());
            let mut fail_event = Event::new(
                SOURCE,
                EventPayload::AgentFailed {
                    error: "internal".to_string(),
                    retry_count: agent.retry_count,
                },
            )
            .for_agent(agent.id)
            .maybe_team(agent.team_id);
            fail_event.seq = self.bus.allocate_seq();
            if let Err(e2) = self.agents.persist_transition(agent, &fail_event).await {
                tracing::error!(agent_id = %agent.id, "forced-failure persistence also failed: {e2}");
            } else {
                self.bus.publish_stamped(fail_event).await;
            }
            return Err(CoreError::internal(std::io::Error::other(e.to_string())));
        }
        self.bus.publish_stamped(event).await;
        Ok(())
    }

    /// Request session teardown; failures go to the reaper.
    async fn reap_session(&self, agent_id: Uuid, session_key: String) {
        if let Err(e) = self.runtime.kill(&session_key).await {
            tracing::warn!(%agent_id, session = %session_key, "session kill failed, queueing reaper: {e}");
            let _ = self.reap_tx.send(ReapRequest { agent_id, session_key, attempts: 1 });
        }
    }

    /// Retry failed session kills until success or the attempts cap, then
    /// flag the orphan for operator attention.
    async fn run_reaper(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ReapRequest>) {
        while let Some(request) = rx.recv().await {
            tokio::time::sleep(self.config.reaper_interval).await;
            match self.runtime.kill(&request.session_key).await {
                Ok(()) => {}
                Err(e) if request.attempts < self.config.reaper_max_attempts => {
                    tracing::warn!(
                        session = %request.session_key,
                        attempts = request.attempts,
                        "reaper kill failed, will retry: {e}"
                    );
                    let _ = self.reap_tx.send(ReapRequest {
                        attempts: request.attempts + 1,
                        ..request
                    });
                }
                Err(e) => {
                    tracing::error!(session = %request.session_key, "session orphaned: {e}");
                    self.bus
                        .publish(
                            Event::new(
                                SOURCE,
                                EventPayload::OrphanSession {
                                    session_key: request.session_key,
                                    attempts: request.attempts,
                                },
                            )
                            .for_agent(request.agent_id),
                        )
                        .await;
                }
            }
        }
    }
}

fn invalid_state(agent: &Agent, operation: &'static str) -> CoreError {
    CoreError::InvalidState {
        entity: "agent",
        id: agent.id.to_string(),
        state: agent.state.to_string(),
        operation,
    }
}

trait MaybeTeam {
    fn maybe_team(self, team_id: Option<Uuid>) -> Self;
}

impl MaybeTeam for Event {
    fn maybe_team(self, team_id: Option<Uuid>) -> Self {
        match team_id {
            Some(team_id) => self.for_team(team_id),
            None => self,
        }
    }
}
