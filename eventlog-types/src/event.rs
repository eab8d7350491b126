use crate::stream::StreamName;
use crate::validation::no_control_characters;
use crate::version::{SequenceNumber, Version};
use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const CORRELATION_ID_KEY: &str = "correlationId";
const CAUSATION_ID_KEY: &str = "causationId";

/// Globally unique identifier of an event.
///
/// Any non-empty string up to 255 characters is accepted so that callers
/// can bring their own identifiers; [`EventId::create`] generates a UUIDv7.
#[nutype(
    validate(not_empty, len_char_max = 255, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh, time-ordered identifier.
    pub fn create() -> Self {
        Self::try_new(Uuid::now_v7().to_string())
            .unwrap_or_else(|_| unreachable!("a hyphenated UUID is always a valid event id"))
    }
}

/// Namespaced event type, e.g. `Billing.Invoice:InvoiceIssued`.
#[nutype(
    validate(not_empty, len_char_max = 255, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// Opaque event payload. The encoding is chosen by the caller; the store
/// persists and returns it unchanged.
///
/// Payloads are stored in a PostgreSQL `TEXT` column, which cannot hold the
/// NUL character (`\0`). Every backend fails the commit of such a payload
/// with a storage failure; encode binary data (e.g. base64) first.
#[nutype(derive(Debug, Clone, PartialEq, Eq, AsRef, Deref, Into, Serialize, Deserialize))]
pub struct EventData(String);

impl From<String> for EventData {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<&str> for EventData {
    fn from(data: &str) -> Self {
        Self::new(data.to_owned())
    }
}

/// Identifier grouping causally related events across streams.
#[nutype(
    validate(not_empty, len_char_max = 255, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(String);

/// Identifier of the message that caused an event.
#[nutype(
    validate(not_empty, len_char_max = 255, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CausationId(String);

/// String-keyed metadata attached to an event.
///
/// Key order is irrelevant: two metadata maps are equal when they hold the
/// same keys with the same values. The keys `correlationId` and
/// `causationId` are reserved for cross-stream tracing; the store indexes
/// their string values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(Map<String, Value>);

impl EventMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a metadata entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.0.insert(key.into(), value.into());
        self
    }

    /// Set the reserved `correlationId` entry.
    pub fn with_correlation_id(self, correlation_id: &CorrelationId) -> Self {
        self.with(CORRELATION_ID_KEY, correlation_id.to_string())
    }

    /// Set the reserved `causationId` entry.
    pub fn with_causation_id(self, causation_id: &CausationId) -> Self {
        self.with(CAUSATION_ID_KEY, causation_id.to_string())
    }

    /// The raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The `correlationId` entry, if present and a valid identifier string.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.reserved_string(CORRELATION_ID_KEY)
            .and_then(|value| CorrelationId::try_new(value).ok())
    }

    /// The `causationId` entry, if present and a valid identifier string.
    pub fn causation_id(&self) -> Option<CausationId> {
        self.reserved_string(CAUSATION_ID_KEY)
            .and_then(|value| CausationId::try_new(value).ok())
    }

    /// Whether no entry is set. Empty metadata is stored as `NULL`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All entries.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    fn reserved_string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for EventMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// An event as created by the caller before it is committed.
///
/// Events are immutable: the store never changes id, type, payload or
/// metadata, and [`crate::EventStore::load`] returns them byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: EventType,
    data: EventData,
    #[serde(default)]
    metadata: EventMetadata,
}

impl Event {
    /// Create an event with a generated id and empty metadata.
    pub fn new(event_type: EventType, data: impl Into<EventData>) -> Self {
        Self {
            id: EventId::create(),
            event_type,
            data: data.into(),
            metadata: EventMetadata::new(),
        }
    }

    /// Replace the generated id with a caller-provided one.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// Attach `metadata`, replacing what was set before.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Globally unique identifier of this event.
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Type name of this event.
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Opaque payload.
    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Metadata, including the tracing identifiers.
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Error returned when building an empty [`Events`] batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventsError {
    /// The batch held no events.
    #[error("an event batch must contain at least one event")]
    Empty,
}

/// Non-empty, ordered batch of events committed together.
///
/// Versions are assigned in batch order.
#[derive(Debug, Clone, PartialEq)]
pub struct Events(Vec<Event>);

impl Events {
    /// Batch holding one event.
    pub fn single(event: Event) -> Self {
        Self(vec![event])
    }

    /// The events in commit order.
    pub fn as_slice(&self) -> &[Event] {
        &self.0
    }

    /// Iterate the events in commit order.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.0.iter()
    }

    /// Unwrap the batch.
    pub fn into_vec(self) -> Vec<Event> {
        self.0
    }
}

impl TryFrom<Vec<Event>> for Events {
    type Error = EventsError;

    fn try_from(events: Vec<Event>) -> Result<Self, Self::Error> {
        if events.is_empty() {
            return Err(EventsError::Empty);
        }
        Ok(Self(events))
    }
}

impl From<Event> for Events {
    fn from(event: Event) -> Self {
        Self::single(event)
    }
}

impl IntoIterator for Events {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A persisted event together with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// The event exactly as it was committed.
    pub event: Event,
    /// Stream the event was committed to.
    pub stream_name: StreamName,
    /// Position within that stream, starting at 0.
    pub version: Version,
    /// Position in the whole log.
    pub sequence_number: SequenceNumber,
    /// When the commit attempt that stored the event started.
    pub recorded_at: DateTime<Utc>,
}
