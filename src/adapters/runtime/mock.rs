//! Mock runtime provider for testing.
//!
//! Scripted responses per spawn and per send, call recording, and
//! failure injection. Sessions live in a map so status and kill behave
//! like the real providers.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::ports::{
    RunResult, RuntimeError, RuntimeProvider, RuntimeResult, SessionStatus, SpawnSpec,
};

/// Scripted outcome for one send.
#[derive(Debug, Clone)]
pub struct MockSendResult {
    pub output: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub error: Option<MockFailure>,
    /// Artificial latency before the result lands.
    pub delay: std::time::Duration,
}

impl Default for MockSendResult {
    fn default() -> Self {
        Self {
            output: "ok".to_string(),
            tokens_in: 10,
            tokens_out: 20,
            error: None,
            delay: std::time::Duration::ZERO,
        }
    }
}

impl MockSendResult {
    pub fn success(output: impl Into<String>, tokens_in: u64, tokens_out: u64) -> Self {
        Self { output: output.into(), tokens_in, tokens_out, ..Default::default() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self { error: Some(MockFailure::Transient(message.into())), ..Default::default() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { error: Some(MockFailure::Fatal(message.into())), ..Default::default() }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Injected failure classification.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Transient(String),
    Fatal(String),
}

impl MockFailure {
    fn to_error(&self) -> RuntimeError {
        match self {
            Self::Transient(m) => RuntimeError::Transient(m.clone()),
            Self::Fatal(m) => RuntimeError::Fatal(m.clone()),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Failures consumed by upcoming spawn calls, FIFO.
    spawn_failures: VecDeque<MockFailure>,
    /// Results consumed by upcoming send calls, FIFO. Empty falls back
    /// to `default_send`.
    send_script: VecDeque<MockSendResult>,
    sessions: HashMap<String, SessionStatus>,
    spawn_count: u64,
    send_count: u64,
    kill_count: u64,
    killed_sessions: Vec<String>,
    sent_messages: Vec<String>,
}

/// Scriptable in-memory runtime.
pub struct MockRuntime {
    inner: Arc<RwLock<Inner>>,
    default_send: MockSendResult,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(Inner::default())), default_send: MockSendResult::default() }
    }

    pub fn with_default_send(default_send: MockSendResult) -> Self {
        Self { inner: Arc::new(RwLock::new(Inner::default())), default_send }
    }

    /// Queue a failure for the next spawn call.
    pub async fn fail_next_spawn(&self, failure: MockFailure) {
        self.inner.write().await.spawn_failures.push_back(failure);
    }

    /// Queue a scripted result for the next send call.
    pub async fn script_send(&self, result: MockSendResult) {
        self.inner.write().await.send_script.push_back(result);
    }

    pub async fn spawn_count(&self) -> u64 {
        self.inner.read().await.spawn_count
    }

    pub async fn send_count(&self) -> u64 {
        self.inner.read().await.send_count
    }

    pub async fn kill_count(&self) -> u64 {
        self.inner.read().await.kill_count
    }

    pub async fn killed_sessions(&self) -> Vec<String> {
        self.inner.read().await.killed_sessions.clone()
    }

    /// Messages passed to `send`, in dispatch order.
    pub async fn sent_messages(&self) -> Vec<String> {
        self.inner.read().await.sent_messages.clone()
    }

    pub async fn live_sessions(&self) -> usize {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| !matches!(s, SessionStatus::Gone))
            .count()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeProvider for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, spec: SpawnSpec) -> RuntimeResult<String> {
        let mut inner = self.inner.write().await;
        inner.spawn_count += 1;
        if let Some(failure) = inner.spawn_failures.pop_front() {
            return Err(failure.to_error());
        }
        let session_key = format!("s#{}-{}", inner.spawn_count, spec.agent_id);
        inner.sessions.insert(session_key.clone(), SessionStatus::Ready);
        Ok(session_key)
    }

    async fn send(&self, session_key: &str, message: &str) -> RuntimeResult<RunResult> {
        let scripted = {
            let mut inner = self.inner.write().await;
            inner.send_count += 1;
            if !inner.sessions.contains_key(session_key) {
                return Err(RuntimeError::SessionNotFound(session_key.to_string()));
            }
            inner.sent_messages.push(message.to_string());
            inner.send_script.pop_front().unwrap_or_else(|| self.default_send.clone())
        };
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        if let Some(failure) = &scripted.error {
            return Err(failure.to_error());
        }
        Ok(RunResult {
            output: scripted.output,
            tokens_in: scripted.tokens_in,
            tokens_out: scripted.tokens_out,
        })
    }

    async fn kill(&self, session_key: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.write().await;
        inner.kill_count += 1;
        inner.killed_sessions.push(session_key.to_string());
        // Killing an unknown session succeeds.
        inner.sessions.insert(session_key.to_string(), SessionStatus::Gone);
        Ok(())
    }

    async fn status(&self, session_key: &str) -> RuntimeResult<SessionStatus> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_key).copied().unwrap_or(SessionStatus::Gone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SpawnSpec {
        SpawnSpec {
            agent_id: "a1".to_string(),
            model: "sonnet".to_string(),
            task: "t".to_string(),
            task_spec: None,
            safety: Default::default(),
            context: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_spawn_returns_distinct_sessions() {
        let runtime = MockRuntime::new();
        let a = runtime.spawn(spec()).await.unwrap();
        let b = runtime.spawn(spec()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(runtime.live_sessions().await, 2);
    }

    #[tokio::test]
    async fn test_scripted_spawn_failure_is_consumed() {
        let runtime = MockRuntime::new();
        runtime.fail_next_spawn(MockFailure::Transient("flaky".into())).await;
        assert!(matches!(runtime.spawn(spec()).await, Err(RuntimeError::Transient(_))));
        assert!(runtime.spawn(spec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_unknown_session_succeeds() {
        let runtime = MockRuntime::new();
        runtime.kill("never-spawned").await.unwrap();
        assert_eq!(runtime.kill_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let runtime = MockRuntime::new();
        assert!(matches!(
            runtime.send("nope", "hi").await,
            Err(RuntimeError::SessionNotFound(_))
        ));
        let session = runtime.spawn(spec()).await.unwrap();
        let result = runtime.send(&session, "hi").await.unwrap();
        assert_eq!(result.tokens_in, 10);
        assert_eq!(result.tokens_out, 20);
    }
}
