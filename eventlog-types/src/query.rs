use crate::event::EventEnvelope;
use crate::stream::{EventStreamFilter, StreamSelector};
use crate::version::SequenceNumber;
use std::num::NonZeroU64;

/// A point-in-time read of the event log.
///
/// Selects events by stream selector and optional type filter, optionally
/// bounded to an inclusive sequence-number range and a maximum number of
/// events. Results are ordered by ascending sequence number unless
/// [`LoadQuery::backwards`] is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadQuery {
    selector: StreamSelector,
    filter: Option<EventStreamFilter>,
    minimum_sequence_number: Option<SequenceNumber>,
    maximum_sequence_number: Option<SequenceNumber>,
    limit: Option<NonZeroU64>,
    backwards: bool,
}

impl LoadQuery {
    /// Every event of `selector`, ascending, unbounded.
    pub fn new(selector: impl Into<StreamSelector>) -> Self {
        Self {
            selector: selector.into(),
            filter: None,
            minimum_sequence_number: None,
            maximum_sequence_number: None,
            limit: None,
            backwards: false,
        }
    }

    /// Only events whose type the filter includes.
    pub fn with_filter(mut self, filter: EventStreamFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Only events at or after this position.
    pub fn with_minimum_sequence_number(mut self, sequence_number: SequenceNumber) -> Self {
        self.minimum_sequence_number = Some(sequence_number);
        self
    }

    /// Only events at or before this position.
    pub fn with_maximum_sequence_number(mut self, sequence_number: SequenceNumber) -> Self {
        self.maximum_sequence_number = Some(sequence_number);
        self
    }

    /// At most this many events in total.
    pub fn with_limit(mut self, limit: NonZeroU64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Read in descending sequence-number order.
    pub fn backwards(mut self) -> Self {
        self.backwards = true;
        self
    }

    /// Which streams are read.
    pub fn selector(&self) -> &StreamSelector {
        &self.selector
    }

    /// Type filter, if any.
    pub fn filter(&self) -> Option<&EventStreamFilter> {
        self.filter.as_ref()
    }

    /// Inclusive lower bound.
    pub fn minimum_sequence_number(&self) -> Option<SequenceNumber> {
        self.minimum_sequence_number
    }

    /// Inclusive upper bound.
    pub fn maximum_sequence_number(&self) -> Option<SequenceNumber> {
        self.maximum_sequence_number
    }

    /// Maximum number of events returned.
    pub fn limit(&self) -> Option<NonZeroU64> {
        self.limit
    }

    /// Whether results come newest first.
    pub fn is_backwards(&self) -> bool {
        self.backwards
    }

    /// Whether a persisted event is part of this query's result set,
    /// ignoring the limit.
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        self.selector.matches(envelope)
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(envelope.event.event_type()))
            && self
                .minimum_sequence_number
                .map_or(true, |minimum| envelope.sequence_number >= minimum)
            && self
                .maximum_sequence_number
                .map_or(true, |maximum| envelope.sequence_number <= maximum)
    }
}
