use crate::error::ValidationError;
use crate::utils::unix_millis;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Metadata header set when incoming validation accepted the event.
pub const HEADER_VALIDATION_PASSED: &str = "validation_passed";
/// Metadata header set when incoming validation found violations.
pub const HEADER_VALIDATION_FAILED: &str = "validation_failed";
/// Metadata header carrying the violation message alongside `validation_failed`.
pub const HEADER_VALIDATION_ERROR: &str = "validation_error";

/// Minimum contract for anything sent over a transport.
///
/// Implementations stay object safe so the manager, the validators, and the
/// transports all work over `&dyn TransportEvent` / `Arc<dyn TransportEvent>`.
pub trait TransportEvent: fmt::Debug + Send + Sync {
    /// Unique identifier for correlation.
    fn id(&self) -> &str;

    /// Type tag used for routing and validation.
    fn event_type(&self) -> &str;

    /// Creation time, milliseconds since the Unix epoch. Zero means unset.
    fn timestamp(&self) -> u64;

    /// Opaque payload, addressable as a string-keyed mapping.
    fn payload(&self) -> &Map<String, Value>;

    /// Size of the serialized payload in bytes.
    fn serialized_size(&self) -> usize {
        serde_json::to_vec(self.payload()).map_or(0, |v| v.len())
    }
}

/// General-purpose event carrying a JSON payload.
///
/// The concrete event type used by the demos and tests, and a reasonable
/// default for producers that don't define their own `TransportEvent` types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl GenericEvent {
    /// New event of the given type with a generated id and current timestamp.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: unix_millis(),
            payload: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }
}

impl TransportEvent for GenericEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }
}

/// Per-event delivery metadata.
///
/// The header map is always present; validation annotations and transport
/// extensions write into it without an allocation-or-absence dance.
#[derive(Debug, Clone, Default)]
pub struct EventMetadata {
    /// Identifier of the transport that delivered the event.
    pub transport: String,
    /// Serialized size of the event payload in bytes.
    pub size_bytes: usize,
    /// Wire latency if the transport measured it.
    pub latency: Option<Duration>,
    /// Whether the payload travelled compressed.
    pub compressed: bool,
    /// Free-form annotations.
    pub headers: HashMap<String, String>,
}

impl EventMetadata {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// An inbound event as delivered to consumers: the domain event plus
/// delivery metadata and an arrival timestamp.
#[derive(Debug, Clone)]
pub struct Event {
    pub event: Arc<dyn TransportEvent>,
    pub metadata: EventMetadata,
    pub received_at: SystemTime,
}

impl Event {
    /// Wraps a domain event, stamping arrival time and payload size.
    pub fn new(event: Arc<dyn TransportEvent>, transport: impl Into<String>) -> Self {
        let size_bytes = event.serialized_size();
        Self {
            event,
            metadata: EventMetadata {
                transport: transport.into(),
                size_bytes,
                ..EventMetadata::default()
            },
            received_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        self.event.id()
    }

    pub fn event_type(&self) -> &str {
        self.event.event_type()
    }

    /// Records the outcome of incoming validation in the header map.
    ///
    /// Exactly one of `validation_passed` / `validation_failed` ends up set;
    /// failures additionally carry the violation message.
    pub fn stamp_validation(&mut self, result: &Result<(), ValidationError>) {
        match result {
            Ok(()) => {
                self.metadata
                    .headers
                    .insert(HEADER_VALIDATION_PASSED.to_string(), "true".to_string());
            }
            Err(err) => {
                self.metadata
                    .headers
                    .insert(HEADER_VALIDATION_FAILED.to_string(), "true".to_string());
                self.metadata
                    .headers
                    .insert(HEADER_VALIDATION_ERROR.to_string(), err.to_string());
            }
        }
    }

    pub fn validation_passed(&self) -> bool {
        self.metadata.headers.contains_key(HEADER_VALIDATION_PASSED)
    }

    pub fn validation_failed(&self) -> bool {
        self.metadata.headers.contains_key(HEADER_VALIDATION_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_event_builder() {
        let event = GenericEvent::new("state.delta")
            .with_id("e1")
            .with_field("seq", 7)
            .with_field("user", "u-42");

        assert_eq!(event.id(), "e1");
        assert_eq!(event.event_type(), "state.delta");
        assert!(event.timestamp() > 0);
        assert_eq!(event.payload().len(), 2);
        assert!(event.serialized_size() > 0);
    }

    #[test]
    fn envelope_stamps_size_and_transport() {
        let event = Arc::new(GenericEvent::new("ping").with_field("n", 1));
        let envelope = Event::new(event, "loopback");

        assert_eq!(envelope.metadata.transport, "loopback");
        assert_eq!(envelope.metadata.size_bytes, envelope.event.serialized_size());
        assert!(envelope.metadata.headers.is_empty());
    }

    #[test]
    fn validation_stamp_sets_exactly_one_header() {
        let mut envelope = Event::new(Arc::new(GenericEvent::new("ping")), "loopback");
        envelope.stamp_validation(&Ok(()));
        assert!(envelope.validation_passed());
        assert!(!envelope.validation_failed());

        let mut envelope = Event::new(Arc::new(GenericEvent::new("ping")), "loopback");
        envelope.stamp_validation(&Err(ValidationError::InvalidEventType {
            event_type: "ping".into(),
        }));
        assert!(!envelope.validation_passed());
        assert!(envelope.validation_failed());
        assert!(envelope
            .metadata
            .headers
            .get(HEADER_VALIDATION_ERROR)
            .is_some());
    }

    #[test]
    fn generic_event_round_trips_through_json() {
        let event = GenericEvent::new("snapshot").with_id("s1").with_field("v", 2);
        let json = serde_json::to_string(&event).unwrap();
        let back: GenericEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "s1");
        assert_eq!(back.event_type, "snapshot");
        assert_eq!(back.payload.get("v"), Some(&Value::from(2)));
    }
}
