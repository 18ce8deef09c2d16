//! In-memory event tail.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::CoreResult;
use crate::domain::models::Event;
use crate::domain::ports::{EventQuery, EventRepository};

pub struct InMemoryEventRepository {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }
}

impl Default for InMemoryEventRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn append(&self, event: &Event) -> CoreResult<()> {
        let mut events = self.events.lock().await;
        events.push(event.clone());
        Ok(())
    }

    async fn latest_seq(&self) -> CoreResult<Option<u64>> {
        let events = self.events.lock().await;
        Ok(events.iter().map(|e| e.seq).max())
    }

    async fn list_recent(&self, n: usize) -> CoreResult<Vec<Event>> {
        let events = self.events.lock().await;
        let mut result: Vec<Event> = events.iter().rev().take(n).cloned().collect();
        result.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(result)
    }

    async fn query(&self, query: EventQuery) -> CoreResult<Vec<Event>> {
        let events = self.events.lock().await;
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let mut result: Vec<Event> = events
            .iter()
            .filter(|e| query.kind.as_deref().is_none_or(|k| e.kind() == k))
            .filter(|e| query.agent_id.is_none_or(|a| e.agent_id == Some(a)))
            .filter(|e| query.team_id.is_none_or(|t| e.team_id == Some(t)))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.seq.cmp(&a.seq));
        result.truncate(limit);
        Ok(result)
    }
}
