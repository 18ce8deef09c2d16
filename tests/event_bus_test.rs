//! Event bus integration tests: overflow, ordering, replay bounds.

use std::sync::Arc;
use std::time::Duration;

use drover::domain::models::{Event, EventFilter, EventPayload};
use drover::services::{EventBus, EventBusConfig};

fn tick() -> Event {
    Event::new("test", EventPayload::AgentRunning {})
}

#[tokio::test]
async fn test_slow_subscriber_gets_contiguous_suffix() {
    let bus = Arc::new(EventBus::new(EventBusConfig {
        replay_capacity: 10_000,
        async_queue_capacity: 1_024,
    }));
    // A deliberately small queue stands in for a subscriber stalled for
    // seconds while the swarm keeps publishing.
    let mut slow = bus
        .subscribe_with_capacity("slow", EventFilter::for_kinds(["agent_running"]), 100)
        .await;
    let mut lag_watch = bus
        .subscribe("lag-watch", EventFilter::for_kinds(["lag_warning"]))
        .await;

    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for _ in 0..20_000 {
                bus.publish(tick()).await;
            }
        })
    };
    // Stall before draining anything.
    tokio::time::sleep(Duration::from_millis(200)).await;
    publisher.await.unwrap();

    let mut received = Vec::new();
    while let Some(event) = slow.try_recv() {
        received.push(event.seq);
    }
    assert_eq!(received.len(), 100);
    // Contiguous suffix: strictly ascending with no holes.
    assert!(received.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(slow.dropped() >= 19_000);

    // At least one lag_warning names the stalled subscription.
    let lag = lag_watch.recv().await.unwrap();
    match lag.payload {
        EventPayload::LagWarning { ref subscription, .. } => assert_eq!(subscription, "slow"),
        ref other => panic!("expected lag_warning, got {}", other.kind()),
    }

    // get_recent is unaffected by subscriber lag.
    let recent = bus.get_recent(100).await;
    assert_eq!(recent.len(), 100);
    let max_seq = recent.last().unwrap().seq;
    assert!(recent.iter().enumerate().all(|(i, e)| e.seq == max_seq - 99 + i as u64));
}

#[tokio::test]
async fn test_per_subscription_ordering_under_concurrent_publishers() {
    let bus = Arc::new(EventBus::default());
    let mut sub = bus.subscribe("ordered", EventFilter::all()).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                bus.publish(tick()).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut last = None;
    for _ in 0..800 {
        let event = sub.recv().await.unwrap();
        if let Some(prev) = last {
            assert!(event.seq > prev, "delivery must be ordered by seq");
        }
        last = Some(event.seq);
    }
}

#[tokio::test]
async fn test_replay_filters_by_kind_and_ids() {
    let bus = EventBus::default();
    let agent_id = uuid::Uuid::new_v4();
    bus.publish(tick()).await;
    bus.publish(Event::new("test", EventPayload::AgentPaused {}).for_agent(agent_id)).await;
    bus.publish(Event::new("test", EventPayload::AgentResumed {}).for_agent(agent_id)).await;

    let paused = bus.get_events(&EventFilter::for_kinds(["agent_paused"])).await;
    assert_eq!(paused.len(), 1);

    let for_agent = bus.get_events(&EventFilter::for_agent(agent_id)).await;
    assert_eq!(for_agent.len(), 2);
    assert!(for_agent.windows(2).all(|w| w[1].seq > w[0].seq));
}
