//! Runtime provider port.
//!
//! A runtime provider actually executes agent workloads: a local worktree
//! plus child process, a remote gateway session, or a sandbox VM. The core
//! only needs these four operations plus pre-classified errors.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::{SafetyBoundaries, TaskSpec};

/// Errors from a runtime provider, classified by the provider itself.
/// The lifecycle manager trusts this classification.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Worth retrying: network loss, timeout, resource pressure.
    #[error("Transient runtime error: {0}")]
    Transient(String),

    /// Not worth retrying: bad session, rejected auth, corrupt workspace.
    #[error("Fatal runtime error: {0}")]
    Fatal(String),

    /// The referenced session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl RuntimeError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Everything a provider needs to stand up one agent session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Agent id, stringly so providers stay decoupled from the store.
    pub agent_id: String,
    pub model: String,
    pub task: String,
    pub task_spec: Option<TaskSpec>,
    pub safety: SafetyBoundaries,
    /// Shared team context, flattened to key=value pairs.
    pub context: Vec<(String, String)>,
}

/// Result of one message round-trip through a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub output: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Observed status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Ready,
    Busy,
    Gone,
}

/// Pluggable backend that runs agent workloads.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Provider name for logs and events.
    fn name(&self) -> &'static str;

    /// Stand up a session and return its opaque key.
    async fn spawn(&self, spec: SpawnSpec) -> RuntimeResult<String>;

    /// Send one message into a session and await its result.
    async fn send(&self, session_key: &str, message: &str) -> RuntimeResult<RunResult>;

    /// Tear down a session. Killing an unknown session succeeds.
    async fn kill(&self, session_key: &str) -> RuntimeResult<()>;

    /// Observe a session without mutating it.
    async fn status(&self, session_key: &str) -> RuntimeResult<SessionStatus>;
}
