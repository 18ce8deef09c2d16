//! Event bus: in-process publish/subscribe with bounded replay.
//!
//! Publishing assigns a monotonic sequence, appends to the durable tail
//! (best-effort), keeps a fixed-capacity ring buffer for replay, and
//! delivers to subscriptions. Sync subscriptions run their handler inline;
//! async subscriptions get a dedicated bounded queue that drops its oldest
//! entry on overflow and surfaces the drop as a `lag_warning` event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

use crate::domain::errors::CoreResult;
use crate::domain::models::{Event, EventFilter, EventPayload};
use crate::domain::ports::EventRepository;

/// Optional out-of-process mirror for multi-process consumers.
///
/// Mirror failures never fail the in-process publish; they surface as
/// `mirror_failed` events instead.
#[async_trait::async_trait]
pub trait EventMirror: Send + Sync {
    async fn mirror(&self, event: &Event) -> CoreResult<()>;
}

/// Handler for a sync subscription. Runs inline on the publisher's task;
/// a slow handler slows publishers, an erroring handler becomes a
/// `subscriber_error` event.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> CoreResult<()>;
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Ring buffer capacity for replay.
    pub replay_capacity: usize,
    /// Default per-subscription queue capacity for async delivery.
    pub async_queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 10_000,
            async_queue_capacity: 1_024,
        }
    }
}

struct SyncSubscription {
    name: String,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

struct AsyncQueue {
    inner: std::sync::Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl AsyncQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an event, dropping the oldest on overflow. Returns true if a
    /// drop occurred.
    fn push(&self, event: Event) -> bool {
        let mut overflowed = false;
        {
            let mut queue = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                overflowed = true;
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
        overflowed
    }
}

struct AsyncSubscription {
    name: String,
    filter: EventFilter,
    queue: Arc<AsyncQueue>,
}

/// Receiving half of an async subscription.
pub struct EventSubscriber {
    queue: Arc<AsyncQueue>,
}

impl EventSubscriber {
    /// Await the next event. Returns `None` once the bus side is gone and
    /// the queue has drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut queue = self
                    .queue
                    .inner
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.queue.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    /// Events dropped from this subscription so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}

/// Central event bus.
pub struct EventBus {
    seq: AtomicU64,
    ring: RwLock<VecDeque<Event>>,
    sync_subs: RwLock<Vec<SyncSubscription>>,
    async_subs: RwLock<Vec<AsyncSubscription>>,
    store: Option<Arc<dyn EventRepository>>,
    mirror: Option<Arc<dyn EventMirror>>,
    /// Serializes seq assignment with delivery so subscribers observe
    /// strictly ascending sequences.
    publish_guard: tokio::sync::Mutex<()>,
    /// Total events dropped across all async subscriptions.
    total_dropped: AtomicU64,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            seq: AtomicU64::new(0),
            ring: RwLock::new(VecDeque::with_capacity(config.replay_capacity.min(1_024))),
            sync_subs: RwLock::new(Vec::new()),
            async_subs: RwLock::new(Vec::new()),
            store: None,
            mirror: None,
            publish_guard: tokio::sync::Mutex::new(()),
            total_dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Attach a durable event tail.
    pub fn with_store(mut self, store: Arc<dyn EventRepository>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach an out-of-process mirror.
    pub fn with_mirror(mut self, mirror: Arc<dyn EventMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Re-seed the sequence counter from the durable tail so sequences
    /// stay monotonic across restarts. Call during startup.
    pub async fn initialize_seq_from_store(&self) {
        if let Some(store) = &self.store {
            match store.latest_seq().await {
                Ok(Some(latest)) => {
                    self.seq.store(latest + 1, Ordering::SeqCst);
                    tracing::info!(seq = latest + 1, "event bus sequence restored from store");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("failed to read latest event sequence: {e}");
                }
            }
        }
    }

    /// Pre-allocate a sequence number so a caller can persist the event
    /// itself (transactionally, next to other rows) before publishing it
    /// via [`publish_stamped`](Self::publish_stamped).
    pub fn allocate_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event. Returns the assigned sequence of the event as
    /// published (derived events such as `lag_warning` get their own).
    pub async fn publish(&self, event: Event) -> u64 {
        self.publish_inner(event, false).await
    }

    /// Publish an event whose sequence was pre-allocated and which is
    /// already durable. Skips seq assignment and the store append; used
    /// by the lifecycle transition path.
    pub async fn publish_stamped(&self, event: Event) -> u64 {
        self.publish_inner(event, true).await
    }

    async fn publish_inner(&self, event: Event, stamped: bool) -> u64 {
        let mut pending = VecDeque::from([(event, stamped)]);
        let mut first_seq = None;
        // Derived events (lag_warning, mirror_failed, subscriber_error) are
        // queued and published iteratively, never recursively.
        while let Some((next, next_stamped)) = pending.pop_front() {
            let _guard = self.publish_guard.lock().await;
            let (seq, derived) = self.publish_one(next, next_stamped).await;
            drop(_guard);
            first_seq.get_or_insert(seq);
            pending.extend(derived.into_iter().map(|e| (e, false)));
        }
        first_seq.unwrap_or(0)
    }

    async fn publish_one(&self, mut event: Event, stamped: bool) -> (u64, Vec<Event>) {
        if !stamped {
            event.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        }
        let seq = event.seq;
        let mut derived = Vec::new();

        // Durable tail, best-effort. Stamped events are already durable.
        if !stamped {
            if let Some(store) = &self.store {
                if let Err(e) = store.append(&event).await {
                    tracing::warn!(seq, kind = event.kind(), "failed to persist event: {e}");
                }
            }
        }

        // Replay ring, FIFO eviction regardless of subscriber state.
        {
            let mut ring = self.ring.write().await;
            if ring.len() >= self.config.replay_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        // Mirror. A failed mirror of a mirror_failed event is only logged.
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.mirror(&event).await {
                if matches!(event.payload, EventPayload::MirrorFailed { .. }) {
                    tracing::warn!("mirror failed for mirror_failed event: {e}");
                } else {
                    derived.push(Event::new(
                        "event_bus",
                        EventPayload::MirrorFailed { error: e.to_string() },
                    ));
                }
            }
        }

        // Sync delivery, inline on this task.
        {
            let subs = self.sync_subs.read().await;
            for sub in subs.iter().filter(|s| s.filter.matches(&event)) {
                if let Err(e) = sub.handler.handle(&event).await {
                    tracing::warn!(subscription = %sub.name, "sync handler error: {e}");
                    if !matches!(event.payload, EventPayload::SubscriberError { .. }) {
                        derived.push(Event::new(
                            "event_bus",
                            EventPayload::SubscriberError {
                                subscription: sub.name.clone(),
                                error: e.to_string(),
                            },
                        ));
                    }
                }
            }
        }

        // Async delivery: bounded queue per subscription, oldest dropped
        // on overflow.
        {
            let subs = self.async_subs.read().await;
            for sub in subs.iter().filter(|s| s.filter.matches(&event)) {
                if sub.queue.push(event.clone()) {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    if !matches!(event.payload, EventPayload::LagWarning { .. }) {
                        derived.push(Event::new(
                            "event_bus",
                            EventPayload::LagWarning {
                                subscription: sub.name.clone(),
                                dropped: sub.queue.dropped.load(Ordering::Relaxed),
                            },
                        ));
                    }
                }
            }
        }

        (seq, derived)
    }

    /// Register a sync subscription. The handler runs inline at publish.
    pub async fn subscribe_sync(
        &self,
        name: impl Into<String>,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) {
        let mut subs = self.sync_subs.write().await;
        subs.push(SyncSubscription { name: name.into(), filter, handler });
    }

    /// Register an async subscription with the default queue capacity.
    pub async fn subscribe(&self, name: impl Into<String>, filter: EventFilter) -> EventSubscriber {
        self.subscribe_with_capacity(name, filter, self.config.async_queue_capacity)
            .await
    }

    /// Register an async subscription with an explicit queue capacity.
    pub async fn subscribe_with_capacity(
        &self,
        name: impl Into<String>,
        filter: EventFilter,
        capacity: usize,
    ) -> EventSubscriber {
        let queue = Arc::new(AsyncQueue::new(capacity.max(1)));
        let mut subs = self.async_subs.write().await;
        subs.push(AsyncSubscription {
            name: name.into(),
            filter,
            queue: queue.clone(),
        });
        EventSubscriber { queue }
    }

    /// The last `n` events in the ring, oldest first.
    pub async fn get_recent(&self, n: usize) -> Vec<Event> {
        let ring = self.ring.read().await;
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Filtered view over the ring, oldest first.
    pub async fn get_events(&self, filter: &EventFilter) -> Vec<Event> {
        let ring = self.ring.read().await;
        ring.iter().filter(|e| filter.matches(e)).cloned().collect()
    }

    /// Next sequence that will be assigned.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Events dropped across all async subscriptions since start.
    pub fn dropped_total(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::CoreError;
    use std::sync::atomic::AtomicUsize;

    fn agent_event() -> Event {
        Event::new("test", EventPayload::AgentRunning {})
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic() {
        let bus = EventBus::default();
        let first = bus.publish(agent_event()).await;
        let second = bus.publish(agent_event()).await;
        assert_eq!(second, first + 1);
        assert_eq!(bus.current_seq(), 2);
    }

    #[tokio::test]
    async fn test_async_subscription_receives_in_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe("test", EventFilter::all()).await;

        for _ in 0..5 {
            bus.publish(agent_event()).await;
        }

        let mut last = None;
        for _ in 0..5 {
            let event = sub.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(event.seq > prev);
            }
            last = Some(event.seq);
        }
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::default();
        let mut sub = bus
            .subscribe("paused-only", EventFilter::for_kinds(["agent_paused"]))
            .await;

        bus.publish(agent_event()).await;
        bus.publish(Event::new("test", EventPayload::AgentPaused {})).await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind(), "agent_paused");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_warns() {
        let bus = EventBus::default();
        let mut sub = bus
            .subscribe_with_capacity("tiny", EventFilter::for_kinds(["agent_running"]), 3)
            .await;
        let mut lag_sub = bus
            .subscribe("lag-watch", EventFilter::for_kinds(["lag_warning"]))
            .await;

        for _ in 0..10 {
            bus.publish(agent_event()).await;
        }

        // Contiguous suffix of the stream survives.
        let mut seqs = Vec::new();
        while let Some(event) = sub.try_recv() {
            seqs.push(event.seq);
        }
        assert_eq!(seqs.len(), 3);
        assert!(seqs.windows(2).all(|w| w[1] > w[0]));
        assert!(sub.dropped() >= 7);

        let lag = lag_sub.recv().await.unwrap();
        match lag.payload {
            EventPayload::LagWarning { ref subscription, dropped } => {
                assert_eq!(subscription, "tiny");
                assert!(dropped >= 1);
            }
            ref other => panic!("expected lag_warning, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_is_bounded() {
        let bus = EventBus::new(EventBusConfig { replay_capacity: 100, ..Default::default() });
        for _ in 0..250 {
            bus.publish(agent_event()).await;
        }
        let recent = bus.get_recent(1_000).await;
        assert_eq!(recent.len(), 100);
        // The 100 most recent, oldest first.
        assert_eq!(recent.first().unwrap().seq, 150);
        assert_eq!(recent.last().unwrap().seq, 249);
    }

    #[tokio::test]
    async fn test_get_recent_returns_tail() {
        let bus = EventBus::default();
        for _ in 0..30 {
            bus.publish(agent_event()).await;
        }
        let recent = bus.get_recent(10).await;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.last().unwrap().seq, 29);
    }

    struct FailingHandler {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Event) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Transient("handler broke".into()))
        }
    }

    #[tokio::test]
    async fn test_sync_handler_error_becomes_event() {
        let bus = EventBus::default();
        let handler = Arc::new(FailingHandler { calls: AtomicUsize::new(0) });
        bus.subscribe_sync("breaker", EventFilter::for_kinds(["agent_running"]), handler.clone())
            .await;
        let mut watch = bus
            .subscribe("error-watch", EventFilter::for_kinds(["subscriber_error"]))
            .await;

        bus.publish(agent_event()).await;

        let err_event = watch.recv().await.unwrap();
        match err_event.payload {
            EventPayload::SubscriberError { ref subscription, .. } => {
                assert_eq!(subscription, "breaker");
            }
            ref other => panic!("expected subscriber_error, got {}", other.kind()),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // The bus keeps working after the handler error.
        bus.publish(agent_event()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    struct BrokenMirror;

    #[async_trait::async_trait]
    impl EventMirror for BrokenMirror {
        async fn mirror(&self, _event: &Event) -> CoreResult<()> {
            Err(CoreError::Transient("broker down".into()))
        }
    }

    #[tokio::test]
    async fn test_mirror_failure_does_not_fail_publish() {
        let bus = EventBus::default().with_mirror(Arc::new(BrokenMirror));
        let mut watch = bus
            .subscribe("mirror-watch", EventFilter::for_kinds(["mirror_failed"]))
            .await;

        bus.publish(agent_event()).await;

        let failed = watch.recv().await.unwrap();
        assert_eq!(failed.kind(), "mirror_failed");
        // The original event still made it into the ring.
        let ring = bus.get_events(&EventFilter::for_kinds(["agent_running"])).await;
        assert_eq!(ring.len(), 1);
    }
}
