//! Scan lifecycle events.
//!
//! The orchestrator publishes an [`Event`] at each session and target
//! milestone. Consumers (a request layer pushing updates, a notifier, tests)
//! subscribe with optional type filters instead of polling session state.
//!
//! # Example
//!
//! ```no_run
//! use patrol_core::events::{Event, EventBus, EventType};
//!
//! async fn example() {
//!     let bus = EventBus::new();
//!     let mut rx = bus.subscribe(vec!["scan.target_*".to_string()]);
//!
//!     bus.publish(Event::new(EventType::TargetCompleted, "scan-1", "Completed scan for nginx"));
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{}: {}", event.event_type, event.message);
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Started,
    TargetCompleted,
    TargetFailed,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    /// Dotted name used for filtering, e.g. `scan.completed`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "scan.started",
            EventType::TargetCompleted => "scan.target_completed",
            EventType::TargetFailed => "scan.target_failed",
            EventType::Completed => "scan.completed",
            EventType::Failed => "scan.failed",
            EventType::Cancelled => "scan.cancelled",
        }
    }

    /// Whether this event ends a session. Exactly one is published per session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Completed | EventType::Failed | EventType::Cancelled)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub scan_id: String,
    /// Human-readable message
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: EventType, scan_id: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            scan_id: scan_id.to_string(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Broadcast bus for scan events. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish to all current subscribers. Events with no subscriber are dropped.
    pub fn publish(&self, event: Event) {
        debug!(event_type = %event.event_type, scan_id = %event.scan_id, "Publishing event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events matching any of `filters`.
    ///
    /// A filter is an exact event name (`scan.completed`) or a prefix ending
    /// in `*` (`scan.*`, `scan.target_*`). An empty list matches everything.
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Next matching event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls more than the buffer behind skips the
    /// overwritten events and carries on.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let name = event.event_type.as_str();
        self.filters.iter().any(|filter| match filter.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => filter == name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(subscriber: &mut EventSubscriber) -> Event {
        tokio::time::timeout(Duration::from_millis(100), subscriber.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec![]);

        bus.publish(
            Event::new(EventType::Started, "scan-1", "Scan started").with_metadata("targets", 3),
        );

        let event = next(&mut subscriber).await;
        assert_eq!(event.event_type, EventType::Started);
        assert_eq!(event.scan_id, "scan-1");
        assert_eq!(event.metadata.get("targets").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_prefix_filter() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec!["scan.target_*".to_string()]);

        bus.publish(Event::new(EventType::Started, "scan-1", "started"));
        bus.publish(Event::new(EventType::TargetFailed, "scan-1", "target failed"));

        assert_eq!(next(&mut subscriber).await.event_type, EventType::TargetFailed);
    }

    #[tokio::test]
    async fn test_exact_filter() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec!["scan.completed".to_string()]);

        bus.publish(Event::new(EventType::TargetCompleted, "scan-1", "target done"));
        bus.publish(Event::new(EventType::Completed, "scan-1", "done"));

        assert_eq!(next(&mut subscriber).await.event_type, EventType::Completed);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_stream() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec![]);
        drop(bus);
        assert!(subscriber.recv().await.is_none());
    }

    #[test]
    fn test_event_type_strings() {
        assert_eq!(EventType::Cancelled.as_str(), "scan.cancelled");
        assert!(EventType::Failed.is_terminal());
        assert!(!EventType::TargetCompleted.is_terminal());
    }
}
