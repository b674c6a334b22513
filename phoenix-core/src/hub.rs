//! Event Hub: in-process fan-out of lifecycle events, feeding
//! WebSocket subscribers.
//!
//! Per-topic ordering via one bounded `tokio::mpsc` channel per
//! subscriber; publish never blocks (`try_send`). A subscriber whose
//! channel is full for longer than `SLOW_SUBSCRIBER_GRACE` is evicted.
//! No replay buffer: late joiners get nothing before they subscribe,
//! matching the teacher's cache layer which also never serves stale
//! data to a caller that showed up after an invalidation.

use crate::model::ExperimentEvent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;
const SLOW_SUBSCRIBER_GRACE: Duration = Duration::from_secs(5);

pub type Topic = String;

struct Subscriber {
    tx: mpsc::Sender<ExperimentEvent>,
    first_full_at: Option<Instant>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: DashMap<Topic, DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

pub struct Subscription {
    pub rx: mpsc::Receiver<ExperimentEvent>,
    hub: Arc<EventHub>,
    topic: Topic,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(topic_subs) = self.hub.subscribers.get(&self.topic) {
            topic_subs.remove(&self.id);
        }
    }
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Topic an experiment's events are published under — every
    /// subscriber sees a single experiment's stream; fan-out across
    /// experiments is the caller's job (subscribe to several topics).
    pub fn topic_for(experiment_id: &crate::model::ExperimentId) -> Topic {
        format!("experiment:{experiment_id}")
    }

    pub fn subscribe(self: &Arc<Self>, topic: impl Into<Topic>) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(topic.clone())
            .or_default()
            .insert(id, Subscriber { tx, first_full_at: None });
        Subscription {
            rx,
            hub: self.clone(),
            topic,
            id,
        }
    }

    /// Non-blocking publish: never back-pressures the caller. Full
    /// channels get one grace window before eviction so a
    /// momentarily slow reader isn't punished for a single burst.
    pub fn publish(&self, topic: &str, event: ExperimentEvent) {
        let Some(topic_subs) = self.subscribers.get(topic) else {
            return;
        };
        let now = Instant::now();
        let mut evict = Vec::new();
        for mut entry in topic_subs.iter_mut() {
            let id = *entry.key();
            let sub = entry.value_mut();
            match sub.tx.try_send(event.clone()) {
                Ok(()) => sub.first_full_at = None,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *sub.first_full_at.get_or_insert(now);
                    if now.duration_since(since) > SLOW_SUBSCRIBER_GRACE {
                        evict.push(id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push(id),
            }
        }
        for id in evict {
            topic_subs.remove(&id);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, EventId, ExperimentId};

    fn event(experiment_id: ExperimentId) -> ExperimentEvent {
        ExperimentEvent {
            id: EventId::new(),
            experiment_id,
            kind: EventKind::ExperimentStarted,
            phase: None,
            message: "started".into(),
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let hub = EventHub::new();
        let experiment_id = ExperimentId::new();
        let topic = EventHub::topic_for(&experiment_id);
        let mut sub = hub.subscribe(topic.clone());
        for i in 0..5 {
            let mut e = event(experiment_id);
            e.message = i.to_string();
            hub.publish(&topic, e);
        }
        for i in 0..5 {
            let received = sub.rx.recv().await.unwrap();
            assert_eq!(received.message, i.to_string());
        }
    }

    #[tokio::test]
    async fn publish_to_topic_with_no_subscribers_is_a_no_op() {
        let hub = EventHub::new();
        let experiment_id = ExperimentId::new();
        hub.publish(&EventHub::topic_for(&experiment_id), event(experiment_id));
    }

    #[tokio::test]
    async fn dropping_subscription_removes_it_from_the_topic() {
        let hub = EventHub::new();
        let experiment_id = ExperimentId::new();
        let topic = EventHub::topic_for(&experiment_id);
        let sub = hub.subscribe(topic.clone());
        assert_eq!(hub.subscriber_count(&topic), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn late_joiner_does_not_receive_events_published_before_subscribe() {
        let hub = EventHub::new();
        let experiment_id = ExperimentId::new();
        let topic = EventHub::topic_for(&experiment_id);
        hub.publish(&topic, event(experiment_id));
        let mut sub = hub.subscribe(topic.clone());
        let mut e = event(experiment_id);
        e.message = "after".into();
        hub.publish(&topic, e);
        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.message, "after");
    }
}
