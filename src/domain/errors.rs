//! Core error taxonomy for the drover orchestration system.
//!
//! Every fallible core operation returns [`CoreError`]. The variants map
//! one-to-one onto the stable error kinds surfaced to operators; `kind()`
//! and `exit_code()` give the CLI and any HTTP layer a fixed contract.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller violated a precondition. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed from the entity's current state.
    #[error("Invalid state for {entity} {id}: {state} does not permit {operation}")]
    InvalidState {
        entity: &'static str,
        id: String,
        state: String,
        operation: &'static str,
    },

    /// Referenced agent, team, or session does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A configured concurrency or size ceiling would be breached.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A requested debit or spawn would exceed a hard budget.
    #[error("Budget denied: {0}")]
    BudgetDenied(String),

    /// Retryable upstream error (network, timeout, transient backend).
    #[error("Transient error: {0}")]
    Transient(String),

    /// Unrecoverable error; the owning subtree is marked failed.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Invariant violated inside the core. The operator sees only the
    /// correlation id; the detail goes to the log and event stream.
    #[error("Internal error (correlation {correlation_id})")]
    Internal {
        correlation_id: Uuid,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CoreError {
    /// Construct an `Internal` error with a fresh correlation id.
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            correlation_id: Uuid::new_v4(),
            source: Some(Box::new(source)),
        }
    }

    pub fn agent_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "agent", id: id.to_string() }
    }

    pub fn team_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "team", id: id.to_string() }
    }

    /// Stable machine-readable kind string.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidState { .. } => "invalid_state",
            Self::NotFound { .. } => "not_found",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::BudgetDenied(_) => "budget_denied",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Internal { .. } => "internal",
        }
    }

    /// Returns true if the owning component may retry the operation.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Process exit code for the CLI surface.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::BudgetDenied(_) => 3,
            Self::CapacityExceeded(_) => 4,
            Self::NotFound { .. } => 5,
            Self::InvalidState { .. } => 6,
            Self::Transient(_) | Self::Fatal(_) => 7,
            Self::Internal { .. } => 8,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound { entity: "row", id: String::new() },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Transient(err.to_string()),
            _ => Self::internal(err),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(CoreError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(CoreError::BudgetDenied("x".into()).kind(), "budget_denied");
        assert_eq!(CoreError::Transient("x".into()).kind(), "transient");
    }

    #[test]
    fn test_exit_codes_match_cli_contract() {
        assert_eq!(CoreError::InvalidInput("bad".into()).exit_code(), 2);
        assert_eq!(CoreError::BudgetDenied("cap".into()).exit_code(), 3);
        assert_eq!(CoreError::CapacityExceeded("full".into()).exit_code(), 4);
        assert_eq!(CoreError::agent_not_found(Uuid::new_v4()).exit_code(), 5);
        let err = CoreError::InvalidState {
            entity: "agent",
            id: "a".into(),
            state: "completed".into(),
            operation: "send",
        };
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_only_transient_is_transient() {
        assert!(CoreError::Transient("net".into()).is_transient());
        assert!(!CoreError::Fatal("auth".into()).is_transient());
        assert!(!CoreError::BudgetDenied("cap".into()).is_transient());
    }

    #[test]
    fn test_internal_hides_detail_in_display() {
        let err = CoreError::internal(std::io::Error::other("secret detail"));
        assert!(!err.to_string().contains("secret detail"));
        assert!(err.to_string().contains("correlation"));
    }
}
