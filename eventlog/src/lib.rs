//! `eventlog` - append-only event log with optimistic per-stream concurrency
//!
//! Writers append batches of events to named streams with
//! [`EventStore::commit`], asserting the stream's current version with an
//! [`ExpectedVersion`]. Readers pull events lazily through
//! [`EventStore::load`], either from one stream or from a virtual stream
//! (everything, a category prefix, or a correlation id). Catch-up consumers
//! track their position in the global sequence with a [`CheckpointStorage`]
//! whose lock serializes instances of the same subscriber; [`CatchUp`] runs
//! that protocol end to end.
//!
//! Storage backends live in `eventlog-postgres` and `eventlog-memory`. They
//! plug into the shared [`CommitProtocol`] and [`paginate`] so that every
//! backend assigns versions, retries races and pages reads identically.

mod catchup;
mod commit;
mod reader;

pub use catchup::{CatchUp, CatchUpError, CatchUpProgress, EventHandler};
pub use commit::{CommitProtocol, CommitRetryPolicy, CommitSession, PendingEvent, WriteFailure};
pub use reader::{paginate, PageSource, ReadBatchSize, ReadBatchSizeError};

pub use eventlog_types::{
    CausationId, CausationIdError, CheckpointError, CheckpointStorage, Clock, CommitResult,
    ConcurrencyError, CorrelationId, CorrelationIdError, Event, EventData, EventEnvelope, EventId,
    EventIdError, EventMetadata, EventStore, EventStoreError, EventStream, EventStreamFilter,
    EventType, EventTypeError, Events, EventsError, ExpectedVersion, FixedClock, LoadQuery,
    MaybeVersion, Operation, ProtocolViolation, SequenceNumber, SetupReport, StoreStatus,
    StreamCategory, StreamCategoryError, StreamName, StreamNameError, StreamSelector,
    SubscriberId, SubscriberIdError, SystemClock, Version, VirtualStreamName,
};
