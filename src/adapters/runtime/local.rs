//! Local runtime provider: git worktree isolation plus a child process
//! per session.
//!
//! Each spawn gets its own worktree branched from HEAD under
//! `<data_dir>/workspace`, and a configured worker command started inside
//! it. A send writes one JSON line to the child's stdin and reads one
//! JSON result line from its stdout:
//! `{"result": "...", "tokens_in": N, "tokens_out": N}`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::domain::models::config::RuntimeConfig;
use crate::domain::ports::{
    RunResult, RuntimeError, RuntimeProvider, RuntimeResult, SessionStatus, SpawnSpec,
};

struct LocalSession {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    worktree: PathBuf,
    branch: String,
}

/// Worktree + child-process runtime.
pub struct LocalProcessRuntime {
    config: RuntimeConfig,
    /// Repository root the worktrees branch from.
    repo_root: PathBuf,
    /// Directory holding per-session worktrees.
    workspace_dir: PathBuf,
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<LocalSession>>>>>,
}

impl LocalProcessRuntime {
    pub fn new(config: RuntimeConfig, repo_root: impl Into<PathBuf>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            config,
            repo_root: repo_root.into(),
            workspace_dir: data_dir.as_ref().join("workspace"),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `git worktree add` an isolated copy for this session.
    async fn create_worktree(&self, session_key: &str) -> RuntimeResult<(PathBuf, String)> {
        let branch = format!("agent/{session_key}");
        let path = self.workspace_dir.join(session_key);
        tokio::fs::create_dir_all(&self.workspace_dir)
            .await
            .map_err(|e| RuntimeError::Transient(format!("workspace dir: {e}")))?;

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(["worktree", "add", "-b", &branch])
            .arg(&path)
            .arg("HEAD")
            .output()
            .await
            .map_err(|e| RuntimeError::Transient(format!("git spawn: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Fatal(format!("git worktree add failed: {stderr}")));
        }
        Ok((path, branch))
    }

    async fn remove_worktree(&self, worktree: &Path, branch: &str) {
        let _ = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(["worktree", "remove", "--force"])
            .arg(worktree)
            .output()
            .await;
        let _ = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(["branch", "-D", branch])
            .output()
            .await;
    }

    fn worker_command(&self, spec: &SpawnSpec, worktree: &Path) -> Command {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .current_dir(worktree)
            .env("AGENT_ID", &spec.agent_id)
            .env("AGENT_MODEL", &spec.model)
            .env("AGENT_TASK", &spec.task)
            .env("AGENT_SANDBOXED", spec.safety.sandboxed.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if !spec.safety.allowed_paths.is_empty() {
            command.env("AGENT_ALLOWED_PATHS", spec.safety.allowed_paths.join(":"));
        }
        if !spec.safety.denied_tools.is_empty() {
            command.env("AGENT_DENIED_TOOLS", spec.safety.denied_tools.join(":"));
        }
        for (key, value) in &spec.context {
            command.env(format!("AGENT_CTX_{}", key.to_uppercase()), value);
        }
        command
    }
}

#[async_trait]
impl RuntimeProvider for LocalProcessRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, spec: SpawnSpec) -> RuntimeResult<String> {
        let session_key = format!("local-{}", Uuid::new_v4());
        let (worktree, branch) = self.create_worktree(&session_key).await?;

        let mut child = self
            .worker_command(&spec, &worktree)
            .spawn()
            .map_err(|e| RuntimeError::Transient(format!("worker spawn: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Fatal("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Fatal("worker stdout unavailable".to_string()))?;

        let session = LocalSession {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            worktree,
            branch,
        };
        self.sessions
            .write()
            .await
            .insert(session_key.clone(), Arc::new(Mutex::new(session)));
        tracing::debug!(session = %session_key, "local session started");
        Ok(session_key)
    }

    async fn send(&self, session_key: &str, message: &str) -> RuntimeResult<RunResult> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_key)
                .cloned()
                .ok_or_else(|| RuntimeError::SessionNotFound(session_key.to_string()))?
        };
        let mut session = session.lock().await;

        let request = serde_json::json!({ "message": message });
        let mut line = request.to_string();
        line.push('\n');
        session
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RuntimeError::Transient(format!("worker stdin write: {e}")))?;
        session
            .stdin
            .flush()
            .await
            .map_err(|e| RuntimeError::Transient(format!("worker stdin flush: {e}")))?;

        let reply = session
            .stdout
            .next_line()
            .await
            .map_err(|e| RuntimeError::Transient(format!("worker stdout read: {e}")))?
            .ok_or_else(|| RuntimeError::Transient("worker closed stdout".to_string()))?;

        let parsed: serde_json::Value = serde_json::from_str(&reply)
            .map_err(|e| RuntimeError::Fatal(format!("malformed worker result: {e}")))?;
        if let Some(error) = parsed.get("error").and_then(|v| v.as_str()) {
            return Err(RuntimeError::Fatal(format!("worker error: {error}")));
        }
        Ok(RunResult {
            output: parsed
                .get("result")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            tokens_in: parsed.get("tokens_in").and_then(serde_json::Value::as_u64).unwrap_or(0),
            tokens_out: parsed.get("tokens_out").and_then(serde_json::Value::as_u64).unwrap_or(0),
        })
    }

    async fn kill(&self, session_key: &str) -> RuntimeResult<()> {
        let removed = self.sessions.write().await.remove(session_key);
        let Some(session) = removed else {
            // Killing an unknown session succeeds.
            return Ok(());
        };
        let mut session = session.lock().await;
        if let Err(e) = session.child.kill().await {
            tracing::warn!(session = %session_key, "worker kill: {e}");
        }
        let (worktree, branch) = (session.worktree.clone(), session.branch.clone());
        drop(session);
        self.remove_worktree(&worktree, &branch).await;
        Ok(())
    }

    async fn status(&self, session_key: &str) -> RuntimeResult<SessionStatus> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(session_key) else {
            return Ok(SessionStatus::Gone);
        };
        // A held lock means a send is in flight.
        let result = match session.try_lock() {
            Ok(mut session) => match session.child.try_wait() {
                Ok(Some(_)) => Ok(SessionStatus::Gone),
                Ok(None) => Ok(SessionStatus::Ready),
                Err(e) => Err(RuntimeError::Transient(e.to_string())),
            },
            Err(_) => Ok(SessionStatus::Busy),
        };
        result
    }
}
