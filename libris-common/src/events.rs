//! Event types for the Libris event system
//!
//! Provides the shared event enum and the broadcast `EventBus` that carries
//! provider-call telemetry, circuit transitions and import-job progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Libris event types
///
/// Events are broadcast via EventBus and serialize to tagged JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum LibrisEvent {
    /// One provider fetch finished (successfully or not)
    ///
    /// Triggers:
    /// - Provider stats recorder: persist a `provider_calls` row
    ProviderCall {
        /// Fanout this call belonged to
        request_id: Uuid,
        /// Provider name ("catalog", "storefront", ...)
        provider: String,
        /// Wall time of the call
        duration_ms: f64,
        /// Number of partial records returned
        result_count: usize,
        /// "success", "not_found", "timeout", "unavailable", "rate_limited"
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider circuit breaker changed state
    CircuitStateChanged {
        provider: String,
        old_state: String,
        new_state: String,
        timestamp: DateTime<Utc>,
    },

    /// A lookup finished
    LookupCompleted {
        /// Fingerprint or identifier the lookup was keyed on
        key: String,
        /// "fast_tier", "durable_tier" or "providers"
        source: String,
        /// Number of books returned
        result_count: usize,
        duration_ms: f64,
        timestamp: DateTime<Utc>,
    },

    /// Import job progressed (emitted after every item)
    ImportJobProgress {
        job_id: Uuid,
        status: String,
        discovered: usize,
        imported: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// Cache entries were dropped by an administrator
    CacheInvalidated {
        /// Identifier that was invalidated, or "all"
        scope: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus shared by every component of a service
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LibrisEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events buffered before slow receivers lag
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<LibrisEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: LibrisEvent,
    ) -> Result<usize, broadcast::error::SendError<LibrisEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: LibrisEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let event = LibrisEvent::CacheInvalidated {
            scope: "all".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(bus.emit(event.clone()).unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers_fails_but_lossy_does_not() {
        let bus = EventBus::new(4);
        let event = LibrisEvent::CacheInvalidated {
            scope: "catalog:B000000001".to_string(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = LibrisEvent::ImportJobProgress {
            job_id: Uuid::nil(),
            status: "running".to_string(),
            discovered: 10,
            imported: 3,
            failed: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ImportJobProgress");
        assert_eq!(json["imported"], 3);
    }
}
