use crate::event::{CorrelationId, EventEnvelope, EventType};
use crate::validation::no_control_characters;
use nutype::nutype;
use std::collections::BTreeSet;
use std::fmt;

/// Name of a concrete, independently versioned stream.
///
/// Stream names are matched exactly; they are not trimmed or normalized.
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
pub struct StreamName(String);

/// Literal stream-name prefix selecting a category of streams.
///
/// `orders:` selects `orders:1` and `orders:42`, but neither `order:1` nor
/// `billing:orders:1`. Wildcard characters in the prefix match themselves.
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
pub struct StreamCategory(String);

impl StreamCategory {
    /// Whether `stream_name` starts with this prefix.
    pub fn contains(&self, stream_name: &StreamName) -> bool {
        stream_name.as_str().starts_with(self.as_str())
    }

    /// The prefix as text.
    pub fn as_str(&self) -> &str {
        self
    }
}

impl StreamName {
    /// The name as text.
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Read-only view spanning several streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VirtualStreamName {
    /// Every event in the log.
    All,
    /// Events of all streams whose name starts with the category prefix.
    Category(StreamCategory),
    /// Events whose metadata carries this correlation id.
    CorrelationId(CorrelationId),
}

impl fmt::Display for VirtualStreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "$all"),
            Self::Category(category) => write!(f, "$category:{category}"),
            Self::CorrelationId(correlation_id) => write!(f, "$correlation:{correlation_id}"),
        }
    }
}

/// What a read targets: one concrete stream or a virtual stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamSelector {
    /// Exactly one stream.
    Stream(StreamName),
    /// A view over several streams.
    Virtual(VirtualStreamName),
}

impl StreamSelector {
    /// The whole log.
    pub fn all() -> Self {
        Self::Virtual(VirtualStreamName::All)
    }

    /// Every stream whose name starts with `category`.
    pub fn category(category: StreamCategory) -> Self {
        Self::Virtual(VirtualStreamName::Category(category))
    }

    /// Every event tagged with `correlation_id`, whatever its stream.
    pub fn correlation_id(correlation_id: CorrelationId) -> Self {
        Self::Virtual(VirtualStreamName::CorrelationId(correlation_id))
    }

    /// Whether the persisted event belongs to the selected stream(s).
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        match self {
            Self::Stream(stream_name) => envelope.stream_name == *stream_name,
            Self::Virtual(VirtualStreamName::All) => true,
            Self::Virtual(VirtualStreamName::Category(category)) => {
                category.contains(&envelope.stream_name)
            }
            Self::Virtual(VirtualStreamName::CorrelationId(correlation_id)) => envelope
                .event
                .metadata()
                .correlation_id()
                .is_some_and(|actual| actual == *correlation_id),
        }
    }
}

impl From<StreamName> for StreamSelector {
    fn from(stream_name: StreamName) -> Self {
        Self::Stream(stream_name)
    }
}

impl From<VirtualStreamName> for StreamSelector {
    fn from(virtual_stream: VirtualStreamName) -> Self {
        Self::Virtual(virtual_stream)
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(stream_name) => write!(f, "{stream_name}"),
            Self::Virtual(virtual_stream) => write!(f, "{virtual_stream}"),
        }
    }
}

/// Narrows a read to a set of event types.
///
/// Inclusion match: an event passes when its type is in the set. An empty
/// set lets nothing pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventStreamFilter {
    event_types: BTreeSet<EventType>,
}

impl EventStreamFilter {
    /// Filter letting exactly `event_types` pass.
    pub fn for_event_types(event_types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: event_types.into_iter().collect(),
        }
    }

    /// The included types, sorted.
    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.event_types.iter()
    }

    /// Whether `event_type` is included.
    pub fn matches(&self, event_type: &EventType) -> bool {
        self.event_types.contains(event_type)
    }
}
