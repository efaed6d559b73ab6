//! Broadcasting of registration meta events.
//!
//! Stands in for the broker: the dealer publishes registration lifecycle
//! events here and any number of in-process listeners receive them.

use crate::metrics::Metrics;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use wampd_core::{MetaEventSink, RegistrationEvent};

/// Event data sent through the broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaEvent {
    pub topic: &'static str,
    pub session: u64,
    pub args: Vec<Value>,
}

impl From<RegistrationEvent> for MetaEvent {
    fn from(event: RegistrationEvent) -> Self {
        Self {
            topic: event.topic(),
            session: event.session,
            args: event.args(),
        }
    }
}

/// Filter for meta event listeners.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only these topics (empty = all).
    pub topics: Vec<String>,
    /// Only events caused by these sessions (empty = all).
    pub sessions: Vec<u64>,
}

impl EventFilter {
    /// Returns true if the event matches this filter.
    pub fn matches(&self, event: &MetaEvent) -> bool {
        (self.topics.is_empty() || self.topics.iter().any(|t| t == event.topic))
            && (self.sessions.is_empty() || self.sessions.contains(&event.session))
    }
}

/// Fans meta events out to listeners.
pub struct MetaEventBroadcaster {
    sender: broadcast::Sender<MetaEvent>,

    /// Events published per topic.
    published: DashMap<&'static str, u64>,

    metrics: Option<Arc<Metrics>>,
}

impl MetaEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            sender,
            published: DashMap::new(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribes to every meta event.
    pub fn subscribe(&self) -> broadcast::Receiver<MetaEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active listeners.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Returns how many events were published on `topic`.
    pub fn published(&self, topic: &str) -> u64 {
        self.published.get(topic).map(|n| *n).unwrap_or(0)
    }

    /// Spawns a task that logs every matching event at debug level.
    pub fn spawn_logger(&self, filter: EventFilter) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if filter.matches(&event) {
                            tracing::debug!(
                                "Meta event {} from session {}: {:?}",
                                event.topic,
                                event.session,
                                event.args
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Meta event logger lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl MetaEventSink for MetaEventBroadcaster {
    fn publish(&self, event: RegistrationEvent) {
        let event = MetaEvent::from(event);
        *self.published.entry(event.topic).or_insert(0) += 1;
        if let Some(ref metrics) = self.metrics {
            metrics
                .meta_events_total
                .with_label_values(&[event.topic])
                .inc();
        }
        // No listeners is not an error.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wampd_core::peer::RegistrationEventKind;

    fn event(kind: RegistrationEventKind, session: u64) -> RegistrationEvent {
        RegistrationEvent {
            kind,
            session,
            registration: 7,
            details: None,
        }
    }

    #[test]
    fn test_filter_matching() {
        let created = MetaEvent::from(event(RegistrationEventKind::Create, 1));
        let deleted = MetaEvent::from(event(RegistrationEventKind::Delete, 2));

        assert!(EventFilter::default().matches(&created));

        let by_topic = EventFilter {
            topics: vec!["wamp.registration.on_delete".to_string()],
            ..Default::default()
        };
        assert!(!by_topic.matches(&created));
        assert!(by_topic.matches(&deleted));

        let by_session = EventFilter {
            sessions: vec![1],
            ..Default::default()
        };
        assert!(by_session.matches(&created));
        assert!(!by_session.matches(&deleted));
    }

    #[test]
    fn test_publish_without_listeners() {
        let broadcaster = MetaEventBroadcaster::new(16);
        broadcaster.publish(event(RegistrationEventKind::Register, 1));
        assert_eq!(broadcaster.listener_count(), 0);
        assert_eq!(broadcaster.published("wamp.registration.on_register"), 1);
        assert_eq!(broadcaster.published("wamp.registration.on_create"), 0);
    }

    #[tokio::test]
    async fn test_listener_receives_events() {
        let broadcaster = MetaEventBroadcaster::new(16);
        let mut receiver = broadcaster.subscribe();

        broadcaster.publish(event(RegistrationEventKind::Unregister, 5));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.topic, "wamp.registration.on_unregister");
        assert_eq!(received.session, 5);
        assert_eq!(received.args, vec![json!(5), json!(7)]);
    }

    #[tokio::test]
    async fn test_logger_stops_when_broadcaster_dropped() {
        let broadcaster = MetaEventBroadcaster::new(16);
        let handle = broadcaster.spawn_logger(EventFilter::default());
        broadcaster.publish(event(RegistrationEventKind::Create, 1));
        drop(broadcaster);
        handle.await.unwrap();
    }
}
