//! In-memory backend for the `eventlog` event store
//!
//! Emulates the PostgreSQL backend's constraints (unique event ids, unique
//! stream versions, identity-assigned sequence numbers, non-blocking
//! checkpoint row locks) inside one process. Useful for tests and for
//! development where persistence is not required.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eventlog::{
    paginate, CheckpointError, CheckpointStorage, CommitProtocol, CommitResult, CommitSession,
    EventEnvelope, EventId, EventStore, EventStoreError, EventStream, Events, ExpectedVersion,
    LoadQuery, MaybeVersion, Operation, PageSource, PendingEvent, ProtocolViolation,
    ReadBatchSize, SequenceNumber, SetupReport, StoreStatus, StreamName, SubscriberId, Version,
    WriteFailure,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default)]
struct EventLog {
    ready: bool,
    events: BTreeMap<SequenceNumber, EventEnvelope>,
    versions: HashMap<StreamName, Version>,
    ids: HashSet<EventId>,
    last_sequence_number: u64,
}

impl EventLog {
    fn current_version(&self, stream: &StreamName) -> MaybeVersion {
        self.versions.get(stream).copied().into()
    }

    fn version_taken(&self, stream: &StreamName, version: Version) -> bool {
        self.versions
            .get(stream)
            .is_some_and(|current| *current >= version)
    }

    /// Unique-constraint check for rows about to become visible.
    fn check_constraints(&self, staged: &[EventEnvelope]) -> Result<(), WriteFailure> {
        let mut batch_ids = HashSet::new();
        for envelope in staged {
            let id = envelope.event.id();
            if self.ids.contains(id) || !batch_ids.insert(id) {
                return Err(WriteFailure::DuplicateEventId {
                    detail: format!("event id {id} already exists"),
                });
            }
            if self.version_taken(&envelope.stream_name, envelope.version) {
                return Err(WriteFailure::VersionConflict {
                    detail: format!(
                        "version {} of stream {} already exists",
                        envelope.version, envelope.stream_name
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory event store.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<EventLog>>,
    protocol: CommitProtocol,
    read_batch_size: ReadBatchSize,
}

impl InMemoryEventStore {
    /// Create an empty store. Call [`EventStore::setup`] before using it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit through `protocol`, e.g. with a fixed clock or no retries.
    pub fn with_commit_protocol(mut self, protocol: CommitProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Page size used by `load`.
    pub fn with_read_batch_size(mut self, read_batch_size: ReadBatchSize) -> Self {
        self.read_batch_size = read_batch_size;
        self
    }

    /// The protocol used by `commit`.
    pub fn commit_protocol(&self) -> &CommitProtocol {
        &self.protocol
    }

    /// Open a fresh session for use with [`CommitProtocol::commit`].
    pub fn session(&self) -> InMemoryCommitSession {
        InMemoryCommitSession {
            log: Arc::clone(&self.log),
            staged: None,
        }
    }
}

impl EventStore for InMemoryEventStore {
    async fn setup(&self) -> Result<SetupReport, EventStoreError> {
        let mut log = self.log.lock();
        let mut report = SetupReport::unchanged();
        if !log.ready {
            log.ready = true;
            report.record("created in-memory event log");
            info!("[memory.setup] {report}");
        }
        Ok(report)
    }

    async fn status(&self) -> StoreStatus {
        if self.log.lock().ready {
            StoreStatus::Ok {
                details: "in-memory event log ready".to_owned(),
            }
        } else {
            StoreStatus::SetupRequired {
                details: "in-memory event log has not been set up".to_owned(),
            }
        }
    }

    fn load_query(&self, query: LoadQuery) -> EventStream {
        let pages = MemoryPages {
            log: Arc::clone(&self.log),
        };
        paginate(pages, query, self.read_batch_size)
    }

    async fn commit(
        &self,
        stream: StreamName,
        events: Events,
        expected: ExpectedVersion,
    ) -> Result<CommitResult, EventStoreError> {
        let mut session = self.session();
        self.protocol
            .commit(&mut session, &stream, &events, expected)
            .await
    }

    #[instrument(name = "memory.delete_stream", skip(self))]
    async fn delete_stream(&self, stream: &StreamName) -> Result<(), EventStoreError> {
        let mut log = self.log.lock();
        if !log.ready {
            return Err(setup_required());
        }
        let doomed: Vec<SequenceNumber> = log
            .events
            .iter()
            .filter(|(_, envelope)| envelope.stream_name == *stream)
            .map(|(sequence_number, _)| *sequence_number)
            .collect();
        for sequence_number in &doomed {
            if let Some(envelope) = log.events.remove(sequence_number) {
                let _ = log.ids.remove(envelope.event.id());
            }
        }
        let _ = log.versions.remove(stream);
        debug!(deleted = doomed.len(), "[memory.delete_stream] stream removed");
        Ok(())
    }
}

fn setup_required() -> EventStoreError {
    EventStoreError::SetupRequired {
        detail: "in-memory event log has not been set up".to_owned(),
    }
}

struct MemoryPages {
    log: Arc<Mutex<EventLog>>,
}

impl PageSource for MemoryPages {
    async fn fetch_page(
        &self,
        query: &LoadQuery,
        page_size: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self.log.lock();
        if !log.ready {
            return Err(setup_required());
        }
        let take = usize::try_from(page_size).unwrap_or(usize::MAX);
        let lower = query
            .minimum_sequence_number()
            .unwrap_or_else(SequenceNumber::none);
        let upper = query
            .maximum_sequence_number()
            .unwrap_or_else(|| SequenceNumber::new(u64::MAX));
        if lower > upper {
            return Ok(Vec::new());
        }

        let window = log.events.range(lower..=upper).map(|(_, envelope)| envelope);
        let page = if query.is_backwards() {
            window
                .rev()
                .filter(|envelope| query.matches(envelope))
                .take(take)
                .cloned()
                .collect()
        } else {
            window
                .filter(|envelope| query.matches(envelope))
                .take(take)
                .cloned()
                .collect()
        };
        Ok(page)
    }
}

/// Transaction over the in-memory log.
///
/// Sequence numbers are reserved at insert time and are lost when the
/// transaction rolls back, like identity values in PostgreSQL. Uniqueness is
/// checked again at commit, so a concurrent writer that committed first
/// turns this commit into a version conflict.
#[derive(Debug)]
pub struct InMemoryCommitSession {
    log: Arc<Mutex<EventLog>>,
    staged: Option<Vec<EventEnvelope>>,
}

impl CommitSession for InMemoryCommitSession {
    fn is_in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    async fn begin(&mut self) -> Result<(), WriteFailure> {
        if !self.log.lock().ready {
            return Err(WriteFailure::SetupRequired {
                detail: "in-memory event log has not been set up".to_owned(),
            });
        }
        self.staged = Some(Vec::new());
        Ok(())
    }

    async fn current_version(&mut self, stream: &StreamName) -> Result<MaybeVersion, WriteFailure> {
        Ok(self.log.lock().current_version(stream))
    }

    async fn insert(
        &mut self,
        stream: &StreamName,
        events: &[PendingEvent<'_>],
    ) -> Result<SequenceNumber, WriteFailure> {
        let Some(staged) = self.staged.as_mut() else {
            return Err(WriteFailure::storage(Operation::Insert, "no open transaction"));
        };
        // PostgreSQL TEXT cannot hold NUL.
        if let Some(pending) = events.iter().find(|pending| pending.event.data().contains('\0')) {
            return Err(WriteFailure::storage(
                Operation::Insert,
                format!("payload of event {} contains a NUL character", pending.event.id()),
            ));
        }
        let mut log = self.log.lock();

        let mut rows = Vec::with_capacity(events.len());
        for pending in events {
            log.last_sequence_number += 1;
            rows.push(EventEnvelope {
                event: pending.event.clone(),
                stream_name: stream.clone(),
                version: pending.version,
                sequence_number: SequenceNumber::new(log.last_sequence_number),
                recorded_at: pending.recorded_at,
            });
        }
        log.check_constraints(&rows)?;

        let last = rows
            .last()
            .map_or_else(SequenceNumber::none, |row| row.sequence_number);
        staged.extend(rows);
        Ok(last)
    }

    async fn commit(&mut self) -> Result<(), WriteFailure> {
        let Some(staged) = self.staged.take() else {
            return Err(WriteFailure::storage(
                Operation::CommitTransaction,
                "no open transaction",
            ));
        };
        let mut log = self.log.lock();
        if let Err(failure) = log.check_constraints(&staged) {
            warn!(error = %failure, "[memory.commit] constraint violated at commit");
            return Err(failure);
        }
        for envelope in staged {
            let _ = log.ids.insert(envelope.event.id().clone());
            let _ = log
                .versions
                .insert(envelope.stream_name.clone(), envelope.version);
            let _ = log.events.insert(envelope.sequence_number, envelope);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), WriteFailure> {
        self.staged = None;
        Ok(())
    }
}

#[derive(Debug)]
struct CheckpointRow {
    applied: SequenceNumber,
    locked_by: Option<u64>,
}

#[derive(Debug, Default)]
struct CheckpointTable {
    ready: bool,
    rows: HashMap<SubscriberId, CheckpointRow>,
}

/// Shared checkpoint table; hands out per-subscriber [`InMemoryCheckpointStorage`]s.
///
/// Storages created from the same registry (or its clones) contend for the
/// same row locks, like separate sessions against one database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpoints {
    table: Arc<Mutex<CheckpointTable>>,
    next_holder: Arc<AtomicU64>,
}

impl InMemoryCheckpoints {
    /// Empty table; [`CheckpointStorage::setup`] creates it.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new lock holder for `subscriber_id`.
    pub fn storage(&self, subscriber_id: SubscriberId) -> InMemoryCheckpointStorage {
        InMemoryCheckpointStorage {
            table: Arc::clone(&self.table),
            subscriber_id,
            holder: self.next_holder.fetch_add(1, Ordering::Relaxed),
            lock: Mutex::new(None),
        }
    }
}

/// One subscriber's view of an [`InMemoryCheckpoints`] table.
///
/// Dropping an instance that holds the lock releases it without storing
/// anything, like a database session that ends mid-transaction.
#[derive(Debug)]
pub struct InMemoryCheckpointStorage {
    table: Arc<Mutex<CheckpointTable>>,
    subscriber_id: SubscriberId,
    holder: u64,
    lock: Mutex<Option<SequenceNumber>>,
}

impl InMemoryCheckpointStorage {
    fn uninitialized(&self) -> CheckpointError {
        CheckpointError::Uninitialized {
            subscriber_id: self.subscriber_id.clone(),
        }
    }

    fn protocol(&self, violation: ProtocolViolation) -> CheckpointError {
        CheckpointError::Protocol {
            subscriber_id: self.subscriber_id.clone(),
            violation,
        }
    }
}

impl CheckpointStorage for InMemoryCheckpointStorage {
    fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    async fn setup(&self) -> Result<SetupReport, CheckpointError> {
        let mut table = self.table.lock();
        let mut report = SetupReport::unchanged();
        if !table.ready {
            table.ready = true;
            report.record("created in-memory checkpoint table");
        }
        if !table.rows.contains_key(&self.subscriber_id) {
            let _ = table.rows.insert(
                self.subscriber_id.clone(),
                CheckpointRow {
                    applied: SequenceNumber::none(),
                    locked_by: None,
                },
            );
            report.record(format!("initialized checkpoint of {}", self.subscriber_id));
        }
        Ok(report)
    }

    async fn status(&self) -> StoreStatus {
        let table = self.table.lock();
        if table.ready && table.rows.contains_key(&self.subscriber_id) {
            StoreStatus::Ok {
                details: format!("checkpoint of {} ready", self.subscriber_id),
            }
        } else {
            StoreStatus::SetupRequired {
                details: format!("checkpoint of {} is not initialized", self.subscriber_id),
            }
        }
    }

    #[instrument(
        name = "memory.acquire_lock",
        skip(self),
        fields(subscriber = %self.subscriber_id)
    )]
    async fn acquire_lock(&self) -> Result<SequenceNumber, CheckpointError> {
        let mut held = self.lock.lock();
        if held.is_some() {
            return Err(self.protocol(ProtocolViolation::LockAlreadyHeld));
        }

        let mut table = self.table.lock();
        let row = table
            .rows
            .get_mut(&self.subscriber_id)
            .ok_or_else(|| self.uninitialized())?;
        if row.locked_by.is_some() {
            warn!("[memory.lock_unavailable] checkpoint locked by another instance");
            return Err(CheckpointError::LockUnavailable {
                subscriber_id: self.subscriber_id.clone(),
            });
        }
        row.locked_by = Some(self.holder);
        *held = Some(row.applied);
        Ok(row.applied)
    }

    #[instrument(
        name = "memory.update_and_release_lock",
        skip(self),
        fields(subscriber = %self.subscriber_id)
    )]
    async fn update_and_release_lock(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let Some(acquired) = self.lock.lock().take() else {
            return Err(self.protocol(ProtocolViolation::LockNotHeld));
        };

        let persist_failed = |detail: String| {
            warn!(%sequence_number, "[memory.checkpoint_persist_failed] {detail}");
            CheckpointError::PersistFailed {
                subscriber_id: self.subscriber_id.clone(),
                sequence_number,
                detail,
            }
        };

        let mut table = self.table.lock();
        let Some(row) = table.rows.get_mut(&self.subscriber_id) else {
            return Err(persist_failed("checkpoint row disappeared".to_owned()));
        };
        row.locked_by = None;
        if sequence_number == acquired {
            return Ok(());
        }
        // Same range as the PostgreSQL BIGINT column.
        if i64::try_from(sequence_number.into_inner()).is_err() {
            return Err(persist_failed(format!("{sequence_number} exceeds BIGINT")));
        }
        row.applied = sequence_number;
        Ok(())
    }

    async fn get_highest_applied_sequence_number(&self) -> Result<SequenceNumber, CheckpointError> {
        self.table
            .lock()
            .rows
            .get(&self.subscriber_id)
            .map(|row| row.applied)
            .ok_or_else(|| self.uninitialized())
    }
}

impl Drop for InMemoryCheckpointStorage {
    fn drop(&mut self) {
        if self.lock.get_mut().take().is_none() {
            return;
        }
        if let Some(row) = self.table.lock().rows.get_mut(&self.subscriber_id) {
            if row.locked_by == Some(self.holder) {
                row.locked_by = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog::{Event, EventType, StreamSelector};
    use futures::TryStreamExt;

    fn stream(raw: &str) -> StreamName {
        StreamName::try_new(raw).expect("valid stream name")
    }

    fn event() -> Event {
        Event::new(EventType::try_new("Test:Happened").expect("valid event type"), "{}")
    }

    fn first_version_of(event: &Event) -> PendingEvent<'_> {
        PendingEvent {
            event,
            version: Version::first(),
            recorded_at: chrono::Utc::now(),
        }
    }

    async fn ready_store() -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        let _ = store.setup().await.expect("setup succeeds");
        store
    }

    #[tokio::test]
    async fn commit_before_setup_requires_setup() {
        let store = InMemoryEventStore::new();

        let error = store
            .commit(stream("a"), Events::single(event()), ExpectedVersion::Any)
            .await
            .expect_err("store is not set up");

        assert!(matches!(error, EventStoreError::SetupRequired { .. }));
    }

    #[tokio::test]
    async fn rolled_back_sequence_numbers_are_not_reused() {
        let store = ready_store().await;
        let duplicate = event();
        let _ = store
            .commit(stream("a"), Events::single(duplicate.clone()), ExpectedVersion::Any)
            .await
            .expect("first commit succeeds");
        let _ = store
            .commit(stream("b"), Events::single(duplicate), ExpectedVersion::Any)
            .await
            .expect_err("duplicate id");

        let result = store
            .commit(stream("c"), Events::single(event()), ExpectedVersion::Any)
            .await
            .expect("third commit succeeds");

        assert_eq!(result.sequence_number, SequenceNumber::new(3));
    }

    #[tokio::test]
    async fn interleaved_sessions_conflict_at_commit() {
        let store = ready_store().await;
        let first_event = event();
        let second_event = event();
        let mut first = store.session();
        let mut second = store.session();
        first.begin().await.expect("begin");
        second.begin().await.expect("begin");
        let _ = first
            .insert(&stream("a"), &[first_version_of(&first_event)])
            .await
            .expect("insert");
        let _ = second
            .insert(&stream("a"), &[first_version_of(&second_event)])
            .await
            .expect("insert");
        first.commit().await.expect("first commit wins");

        let failure = second.commit().await.expect_err("second commit loses");

        assert!(failure.is_retryable());
    }

    #[tokio::test]
    async fn deleting_a_stream_keeps_other_streams() {
        let store = ready_store().await;
        for name in ["a", "b", "a"] {
            let _ = store
                .commit(stream(name), Events::single(event()), ExpectedVersion::Any)
                .await
                .expect("commit succeeds");
        }

        store.delete_stream(&stream("a")).await.expect("delete succeeds");

        let remaining: Vec<_> = store
            .load(StreamSelector::all(), None)
            .try_collect()
            .await
            .expect("load succeeds");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stream_name, stream("b"));
    }

    #[tokio::test]
    async fn dropping_a_lock_holder_releases_the_lock() {
        let checkpoints = InMemoryCheckpoints::new();
        let subscriber = SubscriberId::try_new("projector").expect("valid subscriber id");
        let holder = checkpoints.storage(subscriber.clone());
        let _ = holder.setup().await.expect("setup succeeds");
        let _ = holder.acquire_lock().await.expect("lock acquired");

        drop(holder);

        let next = checkpoints.storage(subscriber);
        assert_eq!(
            next.acquire_lock().await.expect("lock released by drop"),
            SequenceNumber::none()
        );
    }
}
