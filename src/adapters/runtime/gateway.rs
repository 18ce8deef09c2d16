//! Gateway-backed runtime provider.
//!
//! Adapts the shared gateway client to the runtime port: spawns become
//! remote sessions, sends become `sessions_send` plus a wait for the
//! session's result event on the pushed event stream.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use crate::domain::errors::CoreError;
use crate::domain::ports::{
    RunResult, RuntimeError, RuntimeProvider, RuntimeResult, SessionStatus, SpawnSpec,
};
use crate::infrastructure::gateway::{GatewayClient, GatewayEvent, SpawnParams};

/// How long a dispatched run may take before it is treated as lost.
const RUN_TIMEOUT: Duration = Duration::from_secs(600);

/// Runtime provider over the execution gateway.
pub struct GatewayRuntime {
    client: Arc<GatewayClient>,
    /// Waiters keyed by session, completed when the session's result
    /// event arrives.
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<RunResult>>>>,
}

impl GatewayRuntime {
    /// Build the runtime and start draining the client's event stream.
    /// Must be called before `GatewayClient::connect`.
    pub fn new(client: Arc<GatewayClient>) -> Arc<Self> {
        let runtime = Arc::new(Self { client: client.clone(), waiters: Arc::new(Mutex::new(HashMap::new())) });
        let mut events = client.take_event_stream();
        let waiters = runtime.waiters.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                Self::handle_event(&waiters, event).await;
            }
        });
        runtime
    }

    async fn handle_event(
        waiters: &Mutex<HashMap<String, oneshot::Sender<RunResult>>>,
        event: GatewayEvent,
    ) {
        if event.class != "agent" {
            return;
        }
        let Some(session_key) = event.body.get("session_key").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(kind) = event.body.get("kind").and_then(|v| v.as_str()) else { return };
        if kind != "run_result" {
            return;
        }
        let result = RunResult {
            output: event
                .body
                .get("result")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            tokens_in: event.body.get("tokens_in").and_then(serde_json::Value::as_u64).unwrap_or(0),
            tokens_out: event
                .body
                .get("tokens_out")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0),
        };
        if let Some(tx) = waiters.lock().await.remove(session_key) {
            let _ = tx.send(result);
        }
    }

    fn map_error(error: CoreError) -> RuntimeError {
        match error {
            CoreError::NotFound { id, .. } => RuntimeError::SessionNotFound(id),
            CoreError::Fatal(m) | CoreError::InvalidInput(m) => RuntimeError::Fatal(m),
            other => RuntimeError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
impl RuntimeProvider for GatewayRuntime {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn spawn(&self, spec: SpawnSpec) -> RuntimeResult<String> {
        let params = SpawnParams {
            model: spec.model,
            task: spec.task,
            allowed_paths: spec.safety.allowed_paths,
            denied_tools: spec.safety.denied_tools,
            sandboxed: spec.safety.sandboxed,
            context: spec.context,
        };
        let spawned = self.client.sessions_spawn(params).await.map_err(Self::map_error)?;
        Ok(spawned.session_key)
    }

    async fn send(&self, session_key: &str, message: &str) -> RuntimeResult<RunResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(session_key.to_string(), tx);

        let accepted = self
            .client
            .sessions_send(session_key, message, Duration::from_secs(30))
            .await
            .map_err(|e| {
                let waiters = self.waiters.clone();
                let key = session_key.to_string();
                tokio::spawn(async move {
                    waiters.lock().await.remove(&key);
                });
                Self::map_error(e)
            })?;
        tracing::debug!(session = %session_key, run = %accepted.run_id, "run accepted");

        match tokio::time::timeout(RUN_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RuntimeError::Transient("gateway event stream closed".to_string())),
            Err(_) => {
                self.waiters.lock().await.remove(session_key);
                Err(RuntimeError::Transient("run result timeout".to_string()))
            }
        }
    }

    async fn kill(&self, session_key: &str) -> RuntimeResult<()> {
        self.waiters.lock().await.remove(session_key);
        self.client.sessions_kill(session_key).await.map_err(Self::map_error)
    }

    async fn status(&self, session_key: &str) -> RuntimeResult<SessionStatus> {
        let sessions = self.client.sessions_list(None).await.map_err(Self::map_error)?;
        let known = sessions.iter().any(|s| s.session_key == session_key);
        if !known {
            return Ok(SessionStatus::Gone);
        }
        let busy = self.waiters.lock().await.contains_key(session_key);
        Ok(if busy { SessionStatus::Busy } else { SessionStatus::Ready })
    }
}
