//! Event repository port.
//!
//! The bus's in-memory ring buffer is the fast path; this port is the
//! durable tail used for audit and replay across restarts.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::Event;

/// Persistent query filter (kind/agent/team, bounded).
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub kind: Option<String>,
    pub agent_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub limit: usize,
}

/// Repository interface for the durable event tail.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append(&self, event: &Event) -> CoreResult<()>;

    /// Highest persisted sequence, if any. Used to re-seed the bus
    /// counter after restart.
    async fn latest_seq(&self) -> CoreResult<Option<u64>>;

    /// Most recent `n` events, newest first.
    async fn list_recent(&self, n: usize) -> CoreResult<Vec<Event>>;

    async fn query(&self, query: EventQuery) -> CoreResult<Vec<Event>>;
}
