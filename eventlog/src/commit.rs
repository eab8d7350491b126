//! Optimistic-concurrency commit protocol.
//!
//! One attempt runs inside a single storage transaction: read the stream's
//! current version, check the caller's [`ExpectedVersion`], assign
//! contiguous versions, insert, commit. When a concurrent writer wins the
//! race for the same versions the attempt is rolled back and retried after
//! an exponentially growing pause. Backends only provide the transactional
//! primitives through [`CommitSession`]; the algorithm lives here so that
//! every backend behaves the same.

use chrono::{DateTime, Utc};
use eventlog_types::{
    Clock, CommitResult, ConcurrencyError, Event, EventStoreError, Events, ExpectedVersion,
    MaybeVersion, Operation, SequenceNumber, StreamName, SystemClock, Version,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Backoff configuration for retrying commits that lost a version race.
///
/// The first retry waits `initial_backoff_ms`, every following retry waits
/// twice as long as the previous one. After `max_retries` retries the commit
/// gives up with [`ConcurrencyError::RetriesExhausted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitRetryPolicy {
    /// Pause before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
}

impl Default for CommitRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 5,
            max_retries: 8,
        }
    }
}

impl CommitRetryPolicy {
    /// Pause before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }

    /// Sum of all pauses taken before giving up.
    pub fn worst_case_backoff(&self) -> Duration {
        (0..self.max_retries).map(|retry| self.backoff(retry)).sum()
    }
}

/// Why a session operation failed, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteFailure {
    /// Another writer already took one of the (stream, version) pairs.
    #[error("version conflict: {detail}")]
    VersionConflict { detail: String },

    /// Serialization failure or deadlock reported by the database.
    #[error("transient conflict: {detail}")]
    Transient { detail: String },

    /// The unique event id index was violated. Never retried.
    #[error("duplicate event id: {detail}")]
    DuplicateEventId { detail: String },

    /// The backing table or one of its columns does not exist.
    #[error("storage is not set up: {detail}")]
    SetupRequired { detail: String },

    /// Anything else the storage reported.
    #[error("storage failure during {operation}: {detail}")]
    Storage { operation: Operation, detail: String },
}

impl WriteFailure {
    /// Shorthand for [`WriteFailure::Storage`].
    pub fn storage(operation: Operation, detail: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation,
            detail: detail.to_string(),
        }
    }

    /// Whether the attempt lost a race and may succeed when restarted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Transient { .. })
    }
}

impl From<WriteFailure> for EventStoreError {
    fn from(failure: WriteFailure) -> Self {
        match failure {
            WriteFailure::DuplicateEventId { detail } => Self::DuplicateEventId { detail },
            WriteFailure::SetupRequired { detail } => Self::SetupRequired { detail },
            WriteFailure::Storage { operation, detail } => Self::StoreFailure { operation, detail },
            WriteFailure::VersionConflict { detail } | WriteFailure::Transient { detail } => {
                Self::StoreFailure {
                    operation: Operation::Insert,
                    detail,
                }
            }
        }
    }
}

/// An event with the version it is about to be stored under.
#[derive(Debug, Clone, Copy)]
pub struct PendingEvent<'a> {
    /// The caller's event, stored as is.
    pub event: &'a Event,
    /// Version within its stream.
    pub version: Version,
    /// Timestamp shared by every event of one commit attempt.
    pub recorded_at: DateTime<Utc>,
}

/// Transactional primitives a backend exposes to [`CommitProtocol`].
///
/// A session owns at most one open transaction. `rollback` on a session
/// without an open transaction is a no-op.
pub trait CommitSession: Send {
    /// Whether a transaction is currently open.
    fn is_in_transaction(&self) -> bool;

    /// Open a transaction.
    fn begin(&mut self) -> impl Future<Output = Result<(), WriteFailure>> + Send;

    /// Highest version of `stream` visible to the open transaction.
    fn current_version(
        &mut self,
        stream: &StreamName,
    ) -> impl Future<Output = Result<MaybeVersion, WriteFailure>> + Send;

    /// Insert the batch in order and return the sequence number assigned to
    /// its last event.
    fn insert(
        &mut self,
        stream: &StreamName,
        events: &[PendingEvent<'_>],
    ) -> impl Future<Output = Result<SequenceNumber, WriteFailure>> + Send;

    /// Make the open transaction durable and close it. Constraint
    /// violations detected only at commit time surface here.
    fn commit(&mut self) -> impl Future<Output = Result<(), WriteFailure>> + Send;

    /// Discard the open transaction, if any.
    fn rollback(&mut self) -> impl Future<Output = Result<(), WriteFailure>> + Send;
}

enum AttemptError {
    Retry(WriteFailure),
    Fatal(EventStoreError),
}

impl From<WriteFailure> for AttemptError {
    fn from(failure: WriteFailure) -> Self {
        if failure.is_retryable() {
            Self::Retry(failure)
        } else {
            Self::Fatal(failure.into())
        }
    }
}

/// Drives commits through a [`CommitSession`] with conflict retries.
#[derive(Clone)]
pub struct CommitProtocol {
    policy: CommitRetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CommitProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitProtocol")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for CommitProtocol {
    fn default() -> Self {
        Self::new(CommitRetryPolicy::default())
    }
}

impl CommitProtocol {
    /// Protocol retrying according to `policy`, stamping events with the system clock.
    pub fn new(policy: CommitRetryPolicy) -> Self {
        Self {
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the `recorded_at` timestamp of committed events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The retry policy in use.
    pub fn policy(&self) -> CommitRetryPolicy {
        self.policy
    }

    /// Append `events` to `stream` using `session`.
    ///
    /// Refuses sessions that already have an open transaction. Every failed
    /// attempt is rolled back before the error is returned or retried.
    #[instrument(
        name = "commit",
        skip(self, session, events),
        fields(stream = %stream, events = events.as_slice().len(), expected = %expected)
    )]
    pub async fn commit<S: CommitSession>(
        &self,
        session: &mut S,
        stream: &StreamName,
        events: &Events,
        expected: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        if session.is_in_transaction() {
            warn!("[commit.refused] session already has an open transaction");
            return Err(EventStoreError::TransactionAlreadyActive);
        }

        let mut retries = 0_u32;
        loop {
            match self.attempt(session, stream, events, expected).await {
                Ok(result) => {
                    info!(
                        version = %result.version,
                        sequence_number = %result.sequence_number,
                        retries,
                        "[commit.done] events committed"
                    );
                    return Ok(result);
                }
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Retry(failure)) => {
                    if retries >= self.policy.max_retries {
                        warn!(
                            retries,
                            error = %failure,
                            "[commit.retries_exhausted] giving up"
                        );
                        return Err(ConcurrencyError::RetriesExhausted {
                            stream: stream.clone(),
                            attempts: retries,
                        }
                        .into());
                    }
                    let delay = self.policy.backoff(retries);
                    retries += 1;
                    warn!(
                        retry = retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %failure,
                        "[commit.retry] lost race for stream version, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<S: CommitSession>(
        &self,
        session: &mut S,
        stream: &StreamName,
        events: &Events,
        expected: ExpectedVersion,
    ) -> Result<CommitResult, AttemptError> {
        session.begin().await?;

        let outcome = self.write(session, stream, events, expected).await;
        if outcome.is_err() {
            if let Err(rollback_error) = session.rollback().await {
                warn!(
                    error = %rollback_error,
                    "[commit.rollback_failed] rollback after failed attempt failed"
                );
            }
        }
        outcome
    }

    async fn write<S: CommitSession>(
        &self,
        session: &mut S,
        stream: &StreamName,
        events: &Events,
        expected: ExpectedVersion,
    ) -> Result<CommitResult, AttemptError> {
        let current = session.current_version(stream).await?;
        if !expected.is_satisfied_by(current) {
            debug!(actual = %current, "[commit.expected_version_mismatch]");
            return Err(AttemptError::Fatal(
                ConcurrencyError::ExpectedVersionMismatch {
                    stream: stream.clone(),
                    expected,
                    actual: current,
                }
                .into(),
            ));
        }

        let recorded_at = self.clock.now();
        let mut version = current.next_version();
        let mut pending = Vec::with_capacity(events.as_slice().len());
        for event in events {
            pending.push(PendingEvent {
                event,
                version,
                recorded_at,
            });
            version = version.next();
        }
        let last_version = pending
            .last()
            .map_or_else(|| current.next_version(), |event| event.version);

        let sequence_number = session.insert(stream, &pending).await?;
        session.commit().await?;

        Ok(CommitResult {
            version: last_version,
            sequence_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog_types::{EventId, EventType, FixedClock};
    use std::collections::VecDeque;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    /// Session double whose failures are scripted per call.
    struct ScriptedSession {
        in_transaction: bool,
        current: MaybeVersion,
        insert_failures: VecDeque<WriteFailure>,
        commit_failures: VecDeque<WriteFailure>,
        next_sequence: u64,
        begins: u32,
        rollbacks: u32,
        commits: u32,
        inserted: Vec<(Version, EventId, DateTime<Utc>)>,
    }

    impl ScriptedSession {
        fn new(current: MaybeVersion) -> Self {
            Self {
                in_transaction: false,
                current,
                insert_failures: VecDeque::new(),
                commit_failures: VecDeque::new(),
                next_sequence: 1,
                begins: 0,
                rollbacks: 0,
                commits: 0,
                inserted: Vec::new(),
            }
        }

        fn failing_inserts(mut self, failures: impl IntoIterator<Item = WriteFailure>) -> Self {
            self.insert_failures.extend(failures);
            self
        }

        fn failing_commits(mut self, failures: impl IntoIterator<Item = WriteFailure>) -> Self {
            self.commit_failures.extend(failures);
            self
        }
    }

    impl CommitSession for ScriptedSession {
        fn is_in_transaction(&self) -> bool {
            self.in_transaction
        }

        async fn begin(&mut self) -> Result<(), WriteFailure> {
            self.begins += 1;
            self.in_transaction = true;
            Ok(())
        }

        async fn current_version(
            &mut self,
            _stream: &StreamName,
        ) -> Result<MaybeVersion, WriteFailure> {
            Ok(self.current)
        }

        async fn insert(
            &mut self,
            _stream: &StreamName,
            events: &[PendingEvent<'_>],
        ) -> Result<SequenceNumber, WriteFailure> {
            if let Some(failure) = self.insert_failures.pop_front() {
                return Err(failure);
            }
            for pending in events {
                self.inserted.push((
                    pending.version,
                    pending.event.id().clone(),
                    pending.recorded_at,
                ));
                self.next_sequence += 1;
            }
            Ok(SequenceNumber::new(self.next_sequence - 1))
        }

        async fn commit(&mut self) -> Result<(), WriteFailure> {
            self.in_transaction = false;
            if let Some(failure) = self.commit_failures.pop_front() {
                return Err(failure);
            }
            self.commits += 1;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), WriteFailure> {
            self.rollbacks += 1;
            self.in_transaction = false;
            Ok(())
        }
    }

    fn stream() -> StreamName {
        StreamName::try_new("orders:1").expect("valid stream name")
    }

    fn batch(size: usize) -> Events {
        let event_type = EventType::try_new("Test:Happened").expect("valid event type");
        let events = (0..size)
            .map(|n| Event::new(event_type.clone(), n.to_string()))
            .collect::<Vec<_>>();
        Events::try_from(events).expect("non-empty batch")
    }

    fn conflict() -> WriteFailure {
        WriteFailure::VersionConflict {
            detail: "duplicate key value violates unique constraint".to_owned(),
        }
    }

    #[tokio::test]
    async fn new_stream_gets_versions_from_zero() {
        let mut session = ScriptedSession::new(MaybeVersion::NoStream);

        let result = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(3), ExpectedVersion::NoStream)
            .await
            .expect("commit succeeds");

        let versions: Vec<u64> = session
            .inserted
            .iter()
            .map(|(version, _, _)| version.into_inner())
            .collect();
        assert_eq!(versions, vec![0, 1, 2]);
        assert_eq!(result.version, Version::new(2));
        assert_eq!(result.sequence_number, SequenceNumber::new(3));
        assert_eq!(session.commits, 1);
        assert_eq!(session.rollbacks, 0);
    }

    #[tokio::test]
    async fn existing_stream_continues_after_current_version() {
        let mut session = ScriptedSession::new(MaybeVersion::Exists(Version::new(4)));

        let result = CommitProtocol::default()
            .commit(
                &mut session,
                &stream(),
                &batch(2),
                ExpectedVersion::Exactly(Version::new(4)),
            )
            .await
            .expect("commit succeeds");

        assert_eq!(result.version, Version::new(6));
    }

    #[tokio::test]
    async fn events_are_stamped_by_the_configured_clock() {
        let instant = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        let protocol = CommitProtocol::default().with_clock(Arc::new(FixedClock(instant)));
        let mut session = ScriptedSession::new(MaybeVersion::NoStream);

        let _ = protocol
            .commit(&mut session, &stream(), &batch(2), ExpectedVersion::Any)
            .await
            .expect("commit succeeds");

        assert!(session
            .inserted
            .iter()
            .all(|(_, _, recorded_at)| *recorded_at == instant));
    }

    #[tokio::test(start_paused = true)]
    async fn expected_version_mismatch_fails_without_retrying() {
        let mut session = ScriptedSession::new(MaybeVersion::Exists(Version::new(0)));
        let started = Instant::now();

        let error = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::NoStream)
            .await
            .expect_err("stream already exists");

        assert_eq!(
            error,
            EventStoreError::Concurrency(ConcurrencyError::ExpectedVersionMismatch {
                stream: stream(),
                expected: ExpectedVersion::NoStream,
                actual: MaybeVersion::Exists(Version::new(0)),
            })
        );
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(session.begins, 1);
        assert_eq!(session.rollbacks, 1);
        assert!(session.inserted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn version_conflicts_are_retried_until_exhausted() {
        let mut session =
            ScriptedSession::new(MaybeVersion::NoStream)
                .failing_inserts((0..9).map(|_| conflict()));
        let started = Instant::now();

        let error = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::Any)
            .await
            .expect_err("every attempt conflicts");

        assert_eq!(
            error,
            EventStoreError::Concurrency(ConcurrencyError::RetriesExhausted {
                stream: stream(),
                attempts: 8,
            })
        );
        assert_eq!(started.elapsed(), Duration::from_millis(1275));
        assert_eq!(session.begins, 9);
        assert_eq!(session.rollbacks, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_then_success_commits_on_retry() {
        let mut session = ScriptedSession::new(MaybeVersion::NoStream).failing_inserts([
            conflict(),
            WriteFailure::Transient {
                detail: "could not serialize access".to_owned(),
            },
        ]);
        let started = Instant::now();

        let result = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::Any)
            .await
            .expect("third attempt succeeds");

        assert_eq!(result.version, Version::first());
        assert_eq!(started.elapsed(), Duration::from_millis(15));
        assert_eq!(session.rollbacks, 2);
        assert_eq!(session.commits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_detected_at_commit_are_retried() {
        let mut session =
            ScriptedSession::new(MaybeVersion::NoStream).failing_commits([conflict()]);

        let result = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(2), ExpectedVersion::Any)
            .await
            .expect("second attempt succeeds");

        assert_eq!(result.version, Version::new(1));
        assert_eq!(session.begins, 2);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_not_retried() {
        let mut session = ScriptedSession::new(MaybeVersion::NoStream).failing_inserts([
            WriteFailure::DuplicateEventId {
                detail: "eventlog_events_id_key".to_owned(),
            },
        ]);

        let error = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::Any)
            .await
            .expect_err("duplicate id");

        assert!(matches!(error, EventStoreError::DuplicateEventId { .. }));
        assert_eq!(session.begins, 1);
        assert_eq!(session.rollbacks, 1);
    }

    #[tokio::test]
    async fn storage_failures_are_propagated_after_rollback() {
        let mut session = ScriptedSession::new(MaybeVersion::NoStream).failing_inserts([
            WriteFailure::storage(Operation::Insert, "connection reset by peer"),
        ]);

        let error = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::Any)
            .await
            .expect_err("storage failure");

        assert_eq!(
            error,
            EventStoreError::StoreFailure {
                operation: Operation::Insert,
                detail: "connection reset by peer".to_owned(),
            }
        );
        assert_eq!(session.rollbacks, 1);
    }

    #[tokio::test]
    async fn session_with_open_transaction_is_refused() {
        let mut session = ScriptedSession::new(MaybeVersion::NoStream);
        session.in_transaction = true;

        let error = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::Any)
            .await
            .expect_err("transaction already open");

        assert_eq!(error, EventStoreError::TransactionAlreadyActive);
        assert_eq!(session.begins, 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retries_are_logged() {
        let mut session =
            ScriptedSession::new(MaybeVersion::NoStream).failing_inserts([conflict()]);

        let _ = CommitProtocol::default()
            .commit(&mut session, &stream(), &batch(1), ExpectedVersion::Any)
            .await
            .expect("second attempt succeeds");

        assert!(logs_contain("[commit.retry]"));
    }

    #[test]
    fn default_policy_waits_1275_ms_in_the_worst_case() {
        let policy = CommitRetryPolicy::default();

        assert_eq!(policy.backoff(0), Duration::from_millis(5));
        assert_eq!(policy.backoff(7), Duration::from_millis(640));
        assert_eq!(policy.worst_case_backoff(), Duration::from_millis(1275));
    }

    #[test]
    fn policy_deserializes_with_defaults_for_missing_fields() {
        let policy: CommitRetryPolicy =
            serde_json::from_str(r#"{"max_retries": 3}"#).expect("valid policy");

        assert_eq!(
            policy,
            CommitRetryPolicy {
                initial_backoff_ms: 5,
                max_retries: 3,
            }
        );
    }
}
