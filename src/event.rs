use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Metadata, Version};

/// An immutable fact emitted by an aggregate.
///
/// Implementors are expected to be enums with one variant per business occurrence, serialized
/// with an explicit discriminant (e.g. `#[serde(tag = "type", content = "data")]`) so that any
/// backend can round-trip them losslessly.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The discriminant of the event, used to route it to the handlers subscribed to it.
    fn event_type(&self) -> &'static str;

    /// The aggregate this event declares it belongs to.
    fn aggregate_id(&self) -> &str;
}

/// An `EventEnvelope` contains the payload (the original event) alongside the event's metadata.
///
/// Envelopes are created once, by the event store at append time, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<Event> {
    /// Uniquely identifies an event among all events emitted from all aggregates.
    pub id: Uuid,
    /// The aggregate instance that emitted the event.
    pub aggregate_id: String,
    /// The name of the aggregate type that emitted the event.
    pub aggregate_type: String,
    /// Position of the event within its aggregate stream, starting from 0.
    pub version: Version,
    /// The original, emitted, event.
    pub payload: Event,
    /// The timestamp of when the event is persisted.
    pub occurred_on: DateTime<Utc>,
    /// Free-form routing data, e.g. tenant and actor of the originating command.
    pub metadata: Metadata,
}

impl<Event> EventEnvelope<Event> {
    /// Returns the version of the event, within its specific aggregate instance.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the original, emitted, event.
    pub const fn payload(&self) -> &Event {
        &self.payload
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl<Event> EventEnvelope<Event>
where
    Event: DomainEvent,
{
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
