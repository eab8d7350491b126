use crate::event::{EventEnvelope, Events};
use crate::query::LoadQuery;
use crate::setup::{SetupReport, StoreStatus};
use crate::stream::{EventStreamFilter, StreamName, StreamSelector};
use crate::version::{CommitResult, ExpectedVersion, MaybeVersion, SequenceNumber};
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;

/// Storage operation that was in flight when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Creating or upgrading the schema.
    Setup,
    /// Inspecting the schema.
    Status,
    /// Opening a transaction.
    BeginTransaction,
    /// Reading a stream's current version.
    ReadVersion,
    /// Inserting events.
    Insert,
    /// Committing a transaction.
    CommitTransaction,
    /// Rolling a transaction back.
    Rollback,
    /// Reading events.
    Load,
    /// Deleting a stream.
    DeleteStream,
    /// Locking a checkpoint row.
    AcquireLock,
    /// Writing a checkpoint.
    UpdateCheckpoint,
    /// Reading a checkpoint without locking it.
    ReadCheckpoint,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Status => "status",
            Self::BeginTransaction => "begin_transaction",
            Self::ReadVersion => "read_version",
            Self::Insert => "insert",
            Self::CommitTransaction => "commit_transaction",
            Self::Rollback => "rollback",
            Self::Load => "load",
            Self::DeleteStream => "delete_stream",
            Self::AcquireLock => "acquire_lock",
            Self::UpdateCheckpoint => "update_checkpoint",
            Self::ReadCheckpoint => "read_checkpoint",
        };
        f.write_str(name)
    }
}

/// Write conflicts reported to the committer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    /// The stream was not in the state the caller asserted. Never retried.
    #[error("stream {stream}: expected version {expected}, but current version is {actual}")]
    ExpectedVersionMismatch {
        stream: StreamName,
        expected: ExpectedVersion,
        actual: MaybeVersion,
    },

    /// Concurrent writers kept winning the race for the next version.
    #[error("stream {stream}: gave up after {attempts} retry attempts on version conflicts")]
    RetriesExhausted { stream: StreamName, attempts: u32 },
}

/// Errors returned by [`EventStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    /// The commit lost against the stream's state or other writers.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// An event id that already exists in the log was committed again.
    #[error("duplicate event id: {detail}")]
    DuplicateEventId { detail: String },

    /// The backing schema is missing; run `setup()` first.
    #[error("event store is not set up: {detail}")]
    SetupRequired { detail: String },

    /// The session handed to the commit protocol already had an open transaction.
    #[error("a transaction is already active on this session")]
    TransactionAlreadyActive,

    /// The storage engine failed; any transaction was rolled back first.
    #[error("storage failure during {operation}: {detail}")]
    StoreFailure { operation: Operation, detail: String },

    /// A persisted row could not be turned back into an event.
    #[error("event at sequence number {sequence_number} could not be decoded: {detail}")]
    DecodingFailed {
        sequence_number: SequenceNumber,
        detail: String,
    },
}

impl EventStoreError {
    /// Whether this is a [`ConcurrencyError`].
    pub fn is_concurrency_error(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }

    /// Shorthand for [`EventStoreError::StoreFailure`].
    pub fn store_failure(operation: Operation, detail: impl fmt::Display) -> Self {
        Self::StoreFailure {
            operation,
            detail: detail.to_string(),
        }
    }
}

/// Lazily pulled, finite sequence of persisted events.
///
/// Dropping the stream before it is exhausted has no side effects.
pub type EventStream = BoxStream<'static, Result<EventEnvelope, EventStoreError>>;

/// Append-only event log with optimistic per-stream concurrency.
///
/// Implementations:
/// - `eventlog-postgres`: PostgreSQL backend
/// - `eventlog-memory`: in-memory backend for tests
pub trait EventStore: Send + Sync {
    /// Create or upgrade the backing schema. Idempotent; reports what changed.
    fn setup(&self) -> impl Future<Output = Result<SetupReport, EventStoreError>> + Send;

    /// Inspect the backing schema without modifying it.
    fn status(&self) -> impl Future<Output = StoreStatus> + Send;

    /// Read the events selected by `query`.
    ///
    /// The returned stream is lazy: nothing is read from storage until it is
    /// polled, and rows are fetched in pages.
    fn load_query(&self, query: LoadQuery) -> EventStream;

    /// Read every event of `selector`, optionally narrowed to some event
    /// types, in ascending sequence-number order.
    fn load(
        &self,
        selector: impl Into<StreamSelector>,
        filter: Option<EventStreamFilter>,
    ) -> EventStream {
        let query = LoadQuery::new(selector);
        let query = match filter {
            Some(filter) => query.with_filter(filter),
            None => query,
        };
        self.load_query(query)
    }

    /// Atomically append `events` to `stream`.
    ///
    /// `expected` is checked against the stream's current version first. A
    /// mismatch fails with [`ConcurrencyError::ExpectedVersionMismatch`];
    /// races with concurrent writers are retried with backoff.
    fn commit(
        &self,
        stream: StreamName,
        events: Events,
        expected: ExpectedVersion,
    ) -> impl Future<Output = Result<CommitResult, EventStoreError>> + Send;

    /// Remove every event of `stream`. Deleting an unknown stream succeeds.
    fn delete_stream(
        &self,
        stream: &StreamName,
    ) -> impl Future<Output = Result<(), EventStoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    #[test]
    fn operations_display_in_snake_case() {
        assert_eq!(Operation::CommitTransaction.to_string(), "commit_transaction");
        assert_eq!(Operation::DeleteStream.to_string(), "delete_stream");
    }

    #[test]
    fn mismatch_message_names_both_versions() {
        let error = EventStoreError::from(ConcurrencyError::ExpectedVersionMismatch {
            stream: StreamName::try_new("orders:1").expect("valid stream name"),
            expected: ExpectedVersion::NoStream,
            actual: MaybeVersion::Exists(Version::new(3)),
        });

        assert!(error.is_concurrency_error());
        assert_eq!(
            error.to_string(),
            "stream orders:1: expected version no stream, but current version is 3"
        );
    }

    #[test]
    fn store_failure_is_not_a_concurrency_error() {
        let error = EventStoreError::store_failure(Operation::Insert, "connection reset");

        assert!(!error.is_concurrency_error());
        assert_eq!(
            error.to_string(),
            "storage failure during insert: connection reset"
        );
    }
}
