//! Behavioural contracts every backend must satisfy.
//!
//! Each scenario is a plain async function returning [`ContractTestResult`];
//! the `*_contract_tests!` macros stamp them out as `#[tokio::test]`s for a
//! concrete backend. Scenarios only touch streams and subscribers whose
//! names carry a fresh UUID, so they can run in parallel against one shared
//! database.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use eventlog::{
    CatchUp, CatchUpError, CheckpointError, CheckpointStorage, CommitResult, ConcurrencyError,
    CorrelationId, Event, EventEnvelope, EventHandler, EventId, EventMetadata, EventStore,
    EventStoreError, EventStream, EventStreamFilter, EventType, Events, ExpectedVersion,
    LoadQuery, MaybeVersion, ProtocolViolation, SequenceNumber, StreamCategory, StreamName,
    StreamSelector, SubscriberId, Version,
};
use futures::{StreamExt, TryStreamExt};
use uuid::Uuid;

/// A contract scenario that did not hold, with the scenario's name.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(
        scenario: &'static str,
        operation: &'static str,
        error: impl fmt::Display,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn ensure(
    scenario: &'static str,
    condition: bool,
    detail: impl FnOnce() -> String,
) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(scenario, detail()))
    }
}

fn unique_token(scenario: &'static str) -> String {
    format!("contract-{}-{}", scenario, Uuid::now_v7().simple())
}

fn stream_name(scenario: &'static str, raw: String) -> Result<StreamName, ContractTestFailure> {
    StreamName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to build stream name `{raw}`: {error}"),
        )
    })
}

fn contract_event(
    scenario: &'static str,
    type_name: &str,
    data: &str,
) -> Result<Event, ContractTestFailure> {
    let event_type = EventType::try_new(type_name).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("invalid event type `{type_name}`: {error}"),
        )
    })?;
    Ok(Event::new(event_type, data))
}

fn batch(scenario: &'static str, events: Vec<Event>) -> Result<Events, ContractTestFailure> {
    Events::try_from(events)
        .map_err(|error| ContractTestFailure::assertion(scenario, error.to_string()))
}

async fn setup_store<S: EventStore>(scenario: &'static str, store: &S) -> ContractTestResult {
    let _ = store
        .setup()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "setup", error))?;
    Ok(())
}

async fn commit_single<S: EventStore>(
    scenario: &'static str,
    store: &S,
    stream: &StreamName,
    event: Event,
    expected: ExpectedVersion,
) -> Result<CommitResult, ContractTestFailure> {
    store
        .commit(stream.clone(), Events::single(event), expected)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "commit", error))
}

async fn collect(
    scenario: &'static str,
    events: EventStream,
) -> Result<Vec<EventEnvelope>, ContractTestFailure> {
    events
        .try_collect()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "load", error))
}

fn versions(events: &[EventEnvelope]) -> Vec<u64> {
    events.iter().map(|envelope| envelope.version.into_inner()).collect()
}

fn payloads(events: &[EventEnvelope]) -> Vec<String> {
    events
        .iter()
        .map(|envelope| envelope.event.data().as_str().to_owned())
        .collect()
}

fn strictly_increasing(events: &[EventEnvelope]) -> bool {
    events
        .windows(2)
        .all(|pair| pair[0].sequence_number < pair[1].sequence_number)
}

/// Repeated `setup()` succeeds and reports no further changes.
pub async fn test_setup_is_idempotent<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "setup_is_idempotent";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;

    let second = store
        .setup()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "setup", error))?;
    ensure(SCENARIO, second.is_unchanged(), || {
        format!("second setup reported changes: {second}")
    })?;

    let status = store.status().await;
    ensure(SCENARIO, status.is_ok(), || format!("expected ok status, got {status}"))
}

/// Consecutive `Any` commits number a stream 0, 1, 2, … without gaps.
pub async fn test_versions_are_contiguous<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "versions_are_contiguous";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let mut results = Vec::new();
    for n in 0..5 {
        let event = contract_event(SCENARIO, "Contract:Counted", &n.to_string())?;
        results.push(commit_single(SCENARIO, &store, &stream, event, ExpectedVersion::Any).await?);
    }

    let committed: Vec<u64> = results.iter().map(|result| result.version.into_inner()).collect();
    ensure(SCENARIO, committed == vec![0, 1, 2, 3, 4], || {
        format!("commit results reported versions {committed:?}")
    })?;

    let loaded = collect(SCENARIO, store.load(stream, None)).await?;
    ensure(SCENARIO, versions(&loaded) == vec![0, 1, 2, 3, 4], || {
        format!("loaded versions {:?}", versions(&loaded))
    })?;
    ensure(SCENARIO, payloads(&loaded) == ["0", "1", "2", "3", "4"], || {
        format!("loaded payloads out of commit order: {:?}", payloads(&loaded))
    })?;

    let loaded_positions: Vec<SequenceNumber> =
        loaded.iter().map(|envelope| envelope.sequence_number).collect();
    let committed_positions: Vec<SequenceNumber> =
        results.iter().map(|result| result.sequence_number).collect();
    ensure(SCENARIO, loaded_positions == committed_positions, || {
        format!(
            "loaded positions {loaded_positions:?} differ from committed {committed_positions:?}"
        )
    })
}

/// A batch receives consecutive versions in batch order.
pub async fn test_batch_commit_assigns_versions_in_order<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "batch_commit_assigns_versions_in_order";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let events = batch(
        SCENARIO,
        vec![
            contract_event(SCENARIO, "Contract:First", "a")?,
            contract_event(SCENARIO, "Contract:Second", "b")?,
            contract_event(SCENARIO, "Contract:Third", "c")?,
        ],
    )?;
    let result = store
        .commit(stream.clone(), events, ExpectedVersion::NoStream)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", error))?;
    ensure(SCENARIO, result.version == Version::new(2), || {
        format!("batch of three should end at version 2, got {}", result.version)
    })?;

    let loaded = collect(SCENARIO, store.load(stream, None)).await?;
    ensure(SCENARIO, payloads(&loaded) == ["a", "b", "c"], || {
        format!("batch loaded as {:?}", payloads(&loaded))
    })?;
    ensure(SCENARIO, strictly_increasing(&loaded), || {
        "sequence numbers within a batch must increase".to_owned()
    })?;
    ensure(
        SCENARIO,
        loaded.last().map(|envelope| envelope.sequence_number) == Some(result.sequence_number),
        || "commit result must carry the last event's sequence number".to_owned(),
    )
}

/// `NoStream` against an existing stream is a mismatch and writes nothing.
pub async fn test_no_stream_conflicts_with_existing_stream<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "no_stream_conflicts_with_existing_stream";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let first = contract_event(SCENARIO, "Contract:Created", "first")?;
    let _ = commit_single(SCENARIO, &store, &stream, first, ExpectedVersion::NoStream).await?;

    let second = contract_event(SCENARIO, "Contract:Created", "second")?;
    match store
        .commit(stream.clone(), Events::single(second), ExpectedVersion::NoStream)
        .await
    {
        Err(EventStoreError::Concurrency(ConcurrencyError::ExpectedVersionMismatch {
            actual: MaybeVersion::Exists(version),
            ..
        })) if version == Version::first() => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "commit", error)),
        Ok(result) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("expected a version mismatch but commit succeeded at {}", result.version),
            ))
        }
    }

    let loaded = collect(SCENARIO, store.load(stream, None)).await?;
    ensure(SCENARIO, payloads(&loaded) == ["first"], || {
        format!("rejected commit left events behind: {:?}", payloads(&loaded))
    })
}

/// Every `ExpectedVersion` variant is checked against the current state.
pub async fn test_expected_version_assertions<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "expected_version_assertions";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    for expected in [ExpectedVersion::StreamExists, ExpectedVersion::Exactly(Version::first())] {
        let event = contract_event(SCENARIO, "Contract:Touched", "missing")?;
        match store.commit(stream.clone(), Events::single(event), expected).await {
            Err(EventStoreError::Concurrency(ConcurrencyError::ExpectedVersionMismatch {
                actual: MaybeVersion::NoStream,
                ..
            })) => {}
            other => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("{expected} against a missing stream returned {other:?}"),
                ))
            }
        }
    }

    let created = contract_event(SCENARIO, "Contract:Touched", "0")?;
    let _ = commit_single(SCENARIO, &store, &stream, created, ExpectedVersion::NoStream).await?;

    let exact = contract_event(SCENARIO, "Contract:Touched", "1")?;
    let result = commit_single(
        SCENARIO,
        &store,
        &stream,
        exact,
        ExpectedVersion::Exactly(Version::first()),
    )
    .await?;
    ensure(SCENARIO, result.version == Version::new(1), || {
        format!("exact commit landed at {}", result.version)
    })?;

    let stale = contract_event(SCENARIO, "Contract:Touched", "stale")?;
    match store
        .commit(
            stream.clone(),
            Events::single(stale),
            ExpectedVersion::Exactly(Version::first()),
        )
        .await
    {
        Err(EventStoreError::Concurrency(ConcurrencyError::ExpectedVersionMismatch {
            actual: MaybeVersion::Exists(version),
            ..
        })) if version == Version::new(1) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("stale exact version returned {other:?}"),
            ))
        }
    }

    let exists = contract_event(SCENARIO, "Contract:Touched", "2")?;
    let result =
        commit_single(SCENARIO, &store, &stream, exists, ExpectedVersion::StreamExists).await?;
    ensure(SCENARIO, result.version == Version::new(2), || {
        format!("stream-exists commit landed at {}", result.version)
    })
}

/// Racing `Any` commits to one stream all succeed with distinct versions.
pub async fn test_concurrent_any_commits_succeed<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "concurrent_any_commits_succeed";
    const WRITERS: usize = 4;

    let store = Arc::new(make_store());
    setup_store(SCENARIO, store.as_ref()).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let mut writers = Vec::with_capacity(WRITERS);
    for writer in 0..WRITERS {
        let event = contract_event(SCENARIO, "Contract:Raced", &writer.to_string())?;
        let store = Arc::clone(&store);
        let stream = stream.clone();
        writers.push(tokio::spawn(async move {
            store
                .commit(stream, Events::single(event), ExpectedVersion::Any)
                .await
        }));
    }

    for writer in writers {
        let outcome = writer
            .await
            .map_err(|error| {
                ContractTestFailure::assertion(SCENARIO, format!("writer task panicked: {error}"))
            })?;
        let _ = outcome
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", error))?;
    }

    let loaded = collect(SCENARIO, store.load(stream, None)).await?;
    let expected: Vec<u64> = (0..WRITERS as u64).collect();
    ensure(SCENARIO, versions(&loaded) == expected, || {
        format!("concurrent commits produced versions {:?}", versions(&loaded))
    })
}

/// Id, type, payload and metadata come back unchanged.
pub async fn test_round_trip_preserves_event<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "round_trip_preserves_event";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let token = unique_token(SCENARIO);
    let stream = stream_name(SCENARIO, token.clone())?;

    let correlation_id = CorrelationId::try_new(format!("{token}-correlation"))
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let id = EventId::try_new(format!("{token}-event"))
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let metadata = EventMetadata::new()
        .with_correlation_id(&correlation_id)
        .with("tenant", "acme")
        .with("attempt", 3)
        .with("tags", serde_json::json!(["a", "b"]));
    let original = contract_event(
        SCENARIO,
        "Billing.Invoice:InvoiceIssued",
        r#"{"amount":"12.50","note":"Grüße \"quoted\"\n"}"#,
    )?
    .with_id(id)
    .with_metadata(metadata);

    let _ = commit_single(
        SCENARIO,
        &store,
        &stream,
        original.clone(),
        ExpectedVersion::NoStream,
    )
    .await?;

    let loaded = collect(SCENARIO, store.load(stream.clone(), None)).await?;
    let [envelope] = loaded.as_slice() else {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one event, loaded {}", loaded.len()),
        ));
    };
    ensure(SCENARIO, envelope.event == original, || {
        format!("event changed in storage: stored {original:?}, loaded {:?}", envelope.event)
    })?;
    ensure(SCENARIO, envelope.stream_name == stream, || {
        format!("event loaded from stream {}", envelope.stream_name)
    })
}

/// Payloads holding NUL cannot be stored by every backend; all of them
/// refuse the commit instead of truncating the payload.
pub async fn test_nul_payload_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "nul_payload_is_rejected";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;
    let event = contract_event(SCENARIO, "Contract:Binary", "before\0after")?;

    match store
        .commit(stream.clone(), Events::single(event), ExpectedVersion::NoStream)
        .await
    {
        Err(EventStoreError::StoreFailure { .. }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("committing a NUL payload returned {other:?}"),
            ))
        }
    }

    let loaded = collect(SCENARIO, store.load(stream, None)).await?;
    ensure(SCENARIO, loaded.is_empty(), || {
        format!("rejected commit left {} events behind", loaded.len())
    })
}

/// A category selects by literal name prefix only.
pub async fn test_category_matches_literal_prefix<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "category_matches_literal_prefix";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let token = unique_token(SCENARIO);

    let names = [
        format!("{token}orders:1"),
        format!("{token}orders:42"),
        format!("{token}order:1"),
        format!("billing:{token}orders:1"),
        format!("{token}a_c%:1"),
        format!("{token}abcd:1"),
    ];
    for name in &names {
        let stream = stream_name(SCENARIO, name.clone())?;
        let event = contract_event(SCENARIO, "Contract:Filed", name)?;
        let _ = commit_single(SCENARIO, &store, &stream, event, ExpectedVersion::Any).await?;
    }

    for (prefix, expected) in [
        (format!("{token}orders:"), vec![names[0].clone(), names[1].clone()]),
        (format!("{token}a_c%"), vec![names[4].clone()]),
    ] {
        let category = StreamCategory::try_new(prefix.clone())
            .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
        let loaded = collect(SCENARIO, store.load(StreamSelector::category(category), None)).await?;
        let streams: Vec<String> = loaded
            .iter()
            .map(|envelope| envelope.stream_name.to_string())
            .collect();
        ensure(SCENARIO, streams == expected, || {
            format!("category {prefix} selected {streams:?}, expected {expected:?}")
        })?;
    }
    Ok(())
}

/// A correlation id selects its events from every stream.
pub async fn test_correlation_id_selects_across_streams<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "correlation_id_selects_across_streams";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let token = unique_token(SCENARIO);
    let correlation_id = CorrelationId::try_new(token.clone())
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;

    let correlated = EventMetadata::new().with_correlation_id(&correlation_id);
    let plan = [
        ("orders", "placed", correlated.clone()),
        ("payments", "unrelated", EventMetadata::new()),
        ("payments", "charged", correlated),
    ];
    for (stream, data, metadata) in plan {
        let stream = stream_name(SCENARIO, format!("{token}-{stream}"))?;
        let event = contract_event(SCENARIO, "Contract:Traced", data)?.with_metadata(metadata);
        let _ = commit_single(SCENARIO, &store, &stream, event, ExpectedVersion::Any).await?;
    }

    let loaded = collect(
        SCENARIO,
        store.load(StreamSelector::correlation_id(correlation_id), None),
    )
    .await?;
    ensure(SCENARIO, payloads(&loaded) == ["placed", "charged"], || {
        format!("correlation selected {:?}", payloads(&loaded))
    })?;
    ensure(SCENARIO, strictly_increasing(&loaded), || {
        "virtual stream must be ordered by sequence number".to_owned()
    })
}

/// A type filter passes only the listed event types.
pub async fn test_type_filter_narrows_load<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "type_filter_narrows_load";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let events = batch(
        SCENARIO,
        vec![
            contract_event(SCENARIO, "Contract:Wanted", "1")?,
            contract_event(SCENARIO, "Contract:Ignored", "2")?,
            contract_event(SCENARIO, "Contract:Wanted", "3")?,
        ],
    )?;
    let _ = store
        .commit(stream.clone(), events, ExpectedVersion::NoStream)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", error))?;

    let wanted = EventType::try_new("Contract:Wanted")
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let filtered = collect(
        SCENARIO,
        store.load(stream.clone(), Some(EventStreamFilter::for_event_types([wanted]))),
    )
    .await?;
    ensure(SCENARIO, payloads(&filtered) == ["1", "3"], || {
        format!("filter selected {:?}", payloads(&filtered))
    })?;

    let nothing = collect(
        SCENARIO,
        store.load(stream, Some(EventStreamFilter::default())),
    )
    .await?;
    ensure(SCENARIO, nothing.is_empty(), || {
        format!("empty filter selected {} events", nothing.len())
    })
}

/// Sequence bounds, limit and descending order compose.
pub async fn test_range_limit_and_direction<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "range_limit_and_direction";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let events = batch(
        SCENARIO,
        (1..=5)
            .map(|n| contract_event(SCENARIO, "Contract:Ranged", &n.to_string()))
            .collect::<Result<Vec<_>, _>>()?,
    )?;
    let _ = store
        .commit(stream.clone(), events, ExpectedVersion::NoStream)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", error))?;
    let all = collect(SCENARIO, store.load(stream.clone(), None)).await?;
    let position = |index: usize| all[index].sequence_number;
    let limit = |n: u64| NonZeroU64::new(n).unwrap_or(NonZeroU64::MIN);

    let cases = [
        (
            "bounded window",
            LoadQuery::new(stream.clone())
                .with_minimum_sequence_number(position(1))
                .with_maximum_sequence_number(position(3)),
            vec!["2", "3", "4"],
        ),
        (
            "limited",
            LoadQuery::new(stream.clone()).with_limit(limit(2)),
            vec!["1", "2"],
        ),
        (
            "backwards",
            LoadQuery::new(stream.clone()).backwards(),
            vec!["5", "4", "3", "2", "1"],
        ),
        (
            "backwards limited from a maximum",
            LoadQuery::new(stream.clone())
                .backwards()
                .with_maximum_sequence_number(position(3))
                .with_limit(limit(2)),
            vec!["4", "3"],
        ),
    ];

    for (label, query, expected) in cases {
        let loaded = collect(SCENARIO, store.load_query(query)).await?;
        ensure(SCENARIO, payloads(&loaded) == expected, || {
            format!("{label} query returned {:?}, expected {expected:?}", payloads(&loaded))
        })?;
    }

    let mut partial = store.load(stream.clone(), None);
    let first = partial.next().await;
    drop(partial);
    ensure(SCENARIO, matches!(first, Some(Ok(_))), || {
        "abandoned read should still have produced its first event".to_owned()
    })?;
    let again = collect(SCENARIO, store.load(stream, None)).await?;
    ensure(SCENARIO, again.len() == 5, || {
        format!("read after an abandoned read returned {} events", again.len())
    })
}

/// Reusing an event id fails without retries.
pub async fn test_duplicate_event_id_is_rejected<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "duplicate_event_id_is_rejected";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let token = unique_token(SCENARIO);
    let first_stream = stream_name(SCENARIO, format!("{token}-first"))?;
    let second_stream = stream_name(SCENARIO, format!("{token}-second"))?;

    let original = contract_event(SCENARIO, "Contract:Unique", "original")?;
    let _ = commit_single(
        SCENARIO,
        &store,
        &first_stream,
        original.clone(),
        ExpectedVersion::Any,
    )
    .await?;

    let events = batch(
        SCENARIO,
        vec![contract_event(SCENARIO, "Contract:Unique", "fresh")?, original],
    )?;
    match store.commit(second_stream.clone(), events, ExpectedVersion::Any).await {
        Err(EventStoreError::DuplicateEventId { .. }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("re-committing an event id returned {other:?}"),
            ))
        }
    }

    let leaked = collect(SCENARIO, store.load(second_stream, None)).await?;
    ensure(SCENARIO, leaked.is_empty(), || {
        format!("rejected batch left {} events behind", leaked.len())
    })
}

/// Deleting a stream leaves other streams intact.
pub async fn test_delete_stream_removes_only_that_stream<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "delete_stream_removes_only_that_stream";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let token = unique_token(SCENARIO);
    let doomed = stream_name(SCENARIO, format!("{token}-doomed"))?;
    let kept = stream_name(SCENARIO, format!("{token}-kept"))?;

    for stream in [&doomed, &kept, &doomed] {
        let event = contract_event(SCENARIO, "Contract:Kept", stream.as_str())?;
        let _ = commit_single(SCENARIO, &store, stream, event, ExpectedVersion::Any).await?;
    }

    store
        .delete_stream(&doomed)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete_stream", error))?;

    let gone = collect(SCENARIO, store.load(doomed.clone(), None)).await?;
    ensure(SCENARIO, gone.is_empty(), || {
        format!("deleted stream still has {} events", gone.len())
    })?;
    let remaining = collect(SCENARIO, store.load(kept, None)).await?;
    ensure(SCENARIO, remaining.len() == 1, || {
        format!("unrelated stream has {} events after delete", remaining.len())
    })?;

    let reborn = contract_event(SCENARIO, "Contract:Kept", "again")?;
    let result = commit_single(SCENARIO, &store, &doomed, reborn, ExpectedVersion::NoStream).await?;
    ensure(SCENARIO, result.version == Version::first(), || {
        format!("recreated stream starts at {}", result.version)
    })
}

/// Loading an unknown stream yields an empty stream.
pub async fn test_missing_stream_loads_nothing<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "missing_stream_loads_nothing";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let stream = stream_name(SCENARIO, unique_token(SCENARIO))?;

    let loaded = collect(SCENARIO, store.load(stream, None)).await?;
    ensure(SCENARIO, loaded.is_empty(), || {
        format!("unknown stream produced {} events", loaded.len())
    })
}

/// Stamp out every event store scenario as a `#[tokio::test]` in module `suite`.
///
/// `make_store` is called once per test and must return a store whose
/// `setup()` may be called repeatedly.
#[macro_export]
macro_rules! event_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_batch_commit_assigns_versions_in_order, test_category_matches_literal_prefix,
                test_concurrent_any_commits_succeed, test_correlation_id_selects_across_streams,
                test_delete_stream_removes_only_that_stream, test_duplicate_event_id_is_rejected,
                test_expected_version_assertions, test_missing_stream_loads_nothing,
                test_no_stream_conflicts_with_existing_stream, test_nul_payload_is_rejected,
                test_range_limit_and_direction,
                test_round_trip_preserves_event, test_setup_is_idempotent,
                test_type_filter_narrows_load, test_versions_are_contiguous,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn setup_is_idempotent_contract() {
                test_setup_is_idempotent($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn versions_are_contiguous_contract() {
                test_versions_are_contiguous($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn batch_commit_assigns_versions_in_order_contract() {
                test_batch_commit_assigns_versions_in_order($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn no_stream_conflicts_with_existing_stream_contract() {
                test_no_stream_conflicts_with_existing_stream($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn expected_version_assertions_contract() {
                test_expected_version_assertions($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_any_commits_succeed_contract() {
                test_concurrent_any_commits_succeed($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn nul_payload_is_rejected_contract() {
                test_nul_payload_is_rejected($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn round_trip_preserves_event_contract() {
                test_round_trip_preserves_event($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn category_matches_literal_prefix_contract() {
                test_category_matches_literal_prefix($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn correlation_id_selects_across_streams_contract() {
                test_correlation_id_selects_across_streams($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn type_filter_narrows_load_contract() {
                test_type_filter_narrows_load($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn range_limit_and_direction_contract() {
                test_range_limit_and_direction($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn duplicate_event_id_is_rejected_contract() {
                test_duplicate_event_id_is_rejected($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn delete_stream_removes_only_that_stream_contract() {
                test_delete_stream_removes_only_that_stream($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_stream_loads_nothing_contract() {
                test_missing_stream_loads_nothing($make_store)
                    .await
                    .expect("event store contract failed");
            }
        }
    };
}

pub use event_store_contract_tests;

fn unique_subscriber(scenario: &'static str) -> Result<SubscriberId, ContractTestFailure> {
    SubscriberId::try_new(unique_token(scenario))
        .map_err(|error| ContractTestFailure::assertion(scenario, error.to_string()))
}

async fn setup_checkpoint<C: CheckpointStorage>(
    scenario: &'static str,
    checkpoints: &C,
) -> ContractTestResult {
    let _ = checkpoints
        .setup()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "setup", error))?;
    Ok(())
}

async fn acquire<C: CheckpointStorage>(
    scenario: &'static str,
    checkpoints: &C,
) -> Result<SequenceNumber, ContractTestFailure> {
    checkpoints
        .acquire_lock()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "acquire_lock", error))
}

async fn release<C: CheckpointStorage>(
    scenario: &'static str,
    checkpoints: &C,
    sequence_number: SequenceNumber,
) -> ContractTestResult {
    checkpoints
        .update_and_release_lock(sequence_number)
        .await
        .map_err(|error| {
            ContractTestFailure::store_error(scenario, "update_and_release_lock", error)
        })
}

/// A fresh checkpoint is acquired at position zero.
pub async fn test_acquire_after_setup_returns_zero<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "acquire_after_setup_returns_zero";

    let checkpoints = make_checkpoints(unique_subscriber(SCENARIO)?);
    setup_checkpoint(SCENARIO, &checkpoints).await?;

    let position = acquire(SCENARIO, &checkpoints).await?;
    ensure(SCENARIO, position == SequenceNumber::none(), || {
        format!("fresh checkpoint returned {position}")
    })?;
    release(SCENARIO, &checkpoints, position).await
}

/// A held lock is unavailable to a second instance until released.
pub async fn test_lock_excludes_other_instances<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "lock_excludes_other_instances";

    let subscriber = unique_subscriber(SCENARIO)?;
    let first = make_checkpoints(subscriber.clone());
    let second = make_checkpoints(subscriber);
    setup_checkpoint(SCENARIO, &first).await?;

    let _ = acquire(SCENARIO, &first).await?;
    match second.acquire_lock().await {
        Err(CheckpointError::LockUnavailable { .. }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("second instance acquiring a held lock returned {other:?}"),
            ))
        }
    }

    release(SCENARIO, &first, SequenceNumber::new(5)).await?;
    let position = acquire(SCENARIO, &second).await?;
    ensure(SCENARIO, position == SequenceNumber::new(5), || {
        format!("second instance saw {position} after the first released at 5")
    })?;
    release(SCENARIO, &second, position).await
}

/// Released progress is visible to other instances.
pub async fn test_release_persists_progress<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "release_persists_progress";

    let subscriber = unique_subscriber(SCENARIO)?;
    let checkpoints = make_checkpoints(subscriber.clone());
    setup_checkpoint(SCENARIO, &checkpoints).await?;

    let _ = acquire(SCENARIO, &checkpoints).await?;
    release(SCENARIO, &checkpoints, SequenceNumber::new(7)).await?;

    let observer = make_checkpoints(subscriber);
    let stored = observer
        .get_highest_applied_sequence_number()
        .await
        .map_err(|error| {
            ContractTestFailure::store_error(SCENARIO, "get_highest_applied_sequence_number", error)
        })?;
    ensure(SCENARIO, stored == SequenceNumber::new(7), || {
        format!("stored position is {stored}, expected 7")
    })?;

    let reacquired = acquire(SCENARIO, &checkpoints).await?;
    ensure(SCENARIO, reacquired == SequenceNumber::new(7), || {
        format!("reacquired at {reacquired}, expected 7")
    })?;
    release(SCENARIO, &checkpoints, reacquired).await
}

/// Releasing at the acquired position unlocks without moving it.
pub async fn test_unchanged_release_still_unlocks<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "unchanged_release_still_unlocks";

    let subscriber = unique_subscriber(SCENARIO)?;
    let first = make_checkpoints(subscriber.clone());
    let second = make_checkpoints(subscriber);
    setup_checkpoint(SCENARIO, &first).await?;

    let position = acquire(SCENARIO, &first).await?;
    release(SCENARIO, &first, position).await?;

    let seen = acquire(SCENARIO, &second).await?;
    ensure(SCENARIO, seen == position, || {
        format!("position moved from {position} to {seen} without an update")
    })?;
    release(SCENARIO, &second, seen).await
}

/// Releasing without a lock and acquiring twice are protocol errors.
pub async fn test_protocol_violations_are_reported<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "protocol_violations_are_reported";

    let checkpoints = make_checkpoints(unique_subscriber(SCENARIO)?);
    setup_checkpoint(SCENARIO, &checkpoints).await?;

    match checkpoints.update_and_release_lock(SequenceNumber::new(1)).await {
        Err(CheckpointError::Protocol {
            violation: ProtocolViolation::LockNotHeld,
            ..
        }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("release without a lock returned {other:?}"),
            ))
        }
    }

    let _ = acquire(SCENARIO, &checkpoints).await?;
    match checkpoints.acquire_lock().await {
        Err(CheckpointError::Protocol {
            violation: ProtocolViolation::LockAlreadyHeld,
            ..
        }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("acquiring twice returned {other:?}"),
            ))
        }
    }

    release(SCENARIO, &checkpoints, SequenceNumber::new(1)).await
}

/// Concurrent and repeated setups leave one zero row.
pub async fn test_checkpoint_setup_is_idempotent<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "checkpoint_setup_is_idempotent";

    let subscriber = unique_subscriber(SCENARIO)?;
    let first = make_checkpoints(subscriber.clone());
    let second = make_checkpoints(subscriber);

    let (left, right) = futures::join!(first.setup(), second.setup());
    let _ = left.map_err(|error| ContractTestFailure::store_error(SCENARIO, "setup", error))?;
    let _ = right.map_err(|error| ContractTestFailure::store_error(SCENARIO, "setup", error))?;

    let again = first
        .setup()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "setup", error))?;
    ensure(SCENARIO, again.is_unchanged(), || {
        format!("repeated setup reported changes: {again}")
    })?;

    let status = first.status().await;
    ensure(SCENARIO, status.is_ok(), || format!("expected ok status, got {status}"))?;

    let stored = first
        .get_highest_applied_sequence_number()
        .await
        .map_err(|error| {
            ContractTestFailure::store_error(SCENARIO, "get_highest_applied_sequence_number", error)
        })?;
    ensure(SCENARIO, stored == SequenceNumber::none(), || {
        format!("fresh checkpoint stores {stored}")
    })
}

/// Operations on a subscriber without a row report it as uninitialized.
pub async fn test_uninitialized_checkpoint_is_reported<F, C>(
    make_checkpoints: F,
) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "uninitialized_checkpoint_is_reported";

    let checkpoints = make_checkpoints(unique_subscriber(SCENARIO)?);

    match checkpoints.acquire_lock().await {
        Err(CheckpointError::Uninitialized { .. }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("acquiring an uninitialized checkpoint returned {other:?}"),
            ))
        }
    }
    match checkpoints.get_highest_applied_sequence_number().await {
        Err(CheckpointError::Uninitialized { .. }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("reading an uninitialized checkpoint returned {other:?}"),
            ))
        }
    }
    match checkpoints.update_and_release_lock(SequenceNumber::new(1)).await {
        Err(CheckpointError::Protocol {
            violation: ProtocolViolation::LockNotHeld,
            ..
        }) => Ok(()),
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("failed acquisition must not leave a lock behind, release returned {other:?}"),
        )),
    }
}

/// Dropping a lock holder frees the lock for a successor.
pub async fn test_dropped_holder_releases_lock<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "dropped_holder_releases_lock";
    const ATTEMPTS: u32 = 100;

    let subscriber = unique_subscriber(SCENARIO)?;
    let holder = make_checkpoints(subscriber.clone());
    setup_checkpoint(SCENARIO, &holder).await?;
    let _ = acquire(SCENARIO, &holder).await?;
    drop(holder);

    let successor = make_checkpoints(subscriber);
    for _ in 0..ATTEMPTS {
        match successor.acquire_lock().await {
            Ok(position) => return release(SCENARIO, &successor, position).await,
            Err(CheckpointError::LockUnavailable { .. }) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(error) => {
                return Err(ContractTestFailure::store_error(SCENARIO, "acquire_lock", error));
            }
        }
    }
    Err(ContractTestFailure::assertion(
        SCENARIO,
        "lock of a dropped holder was never released",
    ))
}

/// A position beyond the storable range must fail the release rather than be
/// stored as a different value, and the failed release still gives up the lock.
pub async fn test_failed_persist_releases_lock<F, C>(make_checkpoints: F) -> ContractTestResult
where
    F: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "failed_persist_releases_lock";
    let unstorable = SequenceNumber::new(u64::MAX);

    let subscriber = unique_subscriber(SCENARIO)?;
    let checkpoints = make_checkpoints(subscriber.clone());
    setup_checkpoint(SCENARIO, &checkpoints).await?;
    let _ = acquire(SCENARIO, &checkpoints).await?;
    release(SCENARIO, &checkpoints, SequenceNumber::new(3)).await?;

    let _ = acquire(SCENARIO, &checkpoints).await?;
    match checkpoints.update_and_release_lock(unstorable).await {
        Err(CheckpointError::PersistFailed {
            sequence_number, ..
        }) if sequence_number == unstorable => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("releasing at {unstorable} returned {other:?}"),
            ))
        }
    }

    match checkpoints.update_and_release_lock(unstorable).await {
        Err(CheckpointError::Protocol {
            violation: ProtocolViolation::LockNotHeld,
            ..
        }) => {}
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("a failed release left the lock held, second release returned {other:?}"),
            ))
        }
    }

    let stored = checkpoints
        .get_highest_applied_sequence_number()
        .await
        .map_err(|error| {
            ContractTestFailure::store_error(SCENARIO, "get_highest_applied_sequence_number", error)
        })?;
    ensure(SCENARIO, stored == SequenceNumber::new(3), || {
        format!("failed release changed the stored position to {stored}")
    })?;

    let successor = make_checkpoints(subscriber);
    let position = acquire(SCENARIO, &successor).await?;
    ensure(SCENARIO, position == SequenceNumber::new(3), || {
        format!("successor acquired at {position}, expected 3")
    })?;
    release(SCENARIO, &successor, position).await
}

/// Stamp out every checkpoint scenario as a `#[tokio::test]` in module `suite`.
///
/// `make_checkpoints` maps a subscriber id to a fresh lock holder; holders
/// built by the same closure must contend for the same rows.
#[macro_export]
macro_rules! checkpoint_storage_contract_tests {
    (suite = $suite:ident, make_checkpoints = $make_checkpoints:expr $(,)?) => {
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_acquire_after_setup_returns_zero, test_checkpoint_setup_is_idempotent,
                test_dropped_holder_releases_lock, test_failed_persist_releases_lock,
                test_lock_excludes_other_instances,
                test_protocol_violations_are_reported, test_release_persists_progress,
                test_unchanged_release_still_unlocks, test_uninitialized_checkpoint_is_reported,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn acquire_after_setup_returns_zero_contract() {
                test_acquire_after_setup_returns_zero($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn lock_excludes_other_instances_contract() {
                test_lock_excludes_other_instances($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn release_persists_progress_contract() {
                test_release_persists_progress($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn unchanged_release_still_unlocks_contract() {
                test_unchanged_release_still_unlocks($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn protocol_violations_are_reported_contract() {
                test_protocol_violations_are_reported($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn checkpoint_setup_is_idempotent_contract() {
                test_checkpoint_setup_is_idempotent($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn uninitialized_checkpoint_is_reported_contract() {
                test_uninitialized_checkpoint_is_reported($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn dropped_holder_releases_lock_contract() {
                test_dropped_holder_releases_lock($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn failed_persist_releases_lock_contract() {
                test_failed_persist_releases_lock($make_checkpoints)
                    .await
                    .expect("checkpoint storage contract failed");
            }
        }
    };
}

pub use checkpoint_storage_contract_tests;

/// Handler that records payloads and can be told to fail on one of them.
#[derive(Debug, Default)]
struct RecordingHandler {
    seen: Vec<String>,
    fail_on: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("refusing payload {0}")]
struct Refused(String);

impl EventHandler for RecordingHandler {
    type Error = Refused;

    async fn handle(&mut self, envelope: &EventEnvelope) -> Result<(), Self::Error> {
        let payload = envelope.event.data().as_str().to_owned();
        if self.fail_on.as_deref() == Some(payload.as_str()) {
            return Err(Refused(payload));
        }
        self.seen.push(payload);
        Ok(())
    }
}

async fn seed_category<S: EventStore>(
    scenario: &'static str,
    store: &S,
    token: &str,
    payloads: &[&str],
) -> Result<StreamCategory, ContractTestFailure> {
    for (index, payload) in payloads.iter().enumerate() {
        let stream = stream_name(scenario, format!("{token}:{}", index % 2))?;
        let event = contract_event(scenario, "Contract:CaughtUp", payload)?;
        let _ = commit_single(scenario, store, &stream, event, ExpectedVersion::Any).await?;
    }
    StreamCategory::try_new(format!("{token}:"))
        .map_err(|error| ContractTestFailure::assertion(scenario, error.to_string()))
}

/// Catch-up applies only events after the stored position and stores the new one.
pub async fn test_catch_up_resumes_from_checkpoint<FS, S, FC, C>(
    make_store: FS,
    make_checkpoints: FC,
) -> ContractTestResult
where
    FS: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
    FC: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "catch_up_resumes_from_checkpoint";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let checkpoints = make_checkpoints(unique_subscriber(SCENARIO)?);
    setup_checkpoint(SCENARIO, &checkpoints).await?;
    let token = unique_token(SCENARIO);

    let category = seed_category(SCENARIO, &store, &token, &["a", "b", "c"]).await?;
    let runner = CatchUp::new(&store, &checkpoints)
        .with_selector(StreamSelector::category(category.clone()))
        .with_batch_size(NonZeroU64::MIN.saturating_add(1));

    let mut first_pass = RecordingHandler::default();
    let progress = runner
        .run(&mut first_pass)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "catch_up", error))?;
    ensure(SCENARIO, first_pass.seen == ["a", "b", "c"], || {
        format!("first pass applied {:?}", first_pass.seen)
    })?;
    ensure(SCENARIO, progress.events_applied == 3, || {
        format!("first pass reported {} events", progress.events_applied)
    })?;

    let _ = seed_category(SCENARIO, &store, &token, &["d"]).await?;
    let mut second_pass = RecordingHandler::default();
    let resumed = runner
        .run(&mut second_pass)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "catch_up", error))?;
    ensure(SCENARIO, second_pass.seen == ["d"], || {
        format!("second pass re-applied events: {:?}", second_pass.seen)
    })?;

    let stored = checkpoints
        .get_highest_applied_sequence_number()
        .await
        .map_err(|error| {
            ContractTestFailure::store_error(SCENARIO, "get_highest_applied_sequence_number", error)
        })?;
    ensure(SCENARIO, stored == resumed.position, || {
        format!("stored position {stored} differs from reported {}", resumed.position)
    })
}

/// A handler failure stores progress up to the last handled event.
pub async fn test_catch_up_keeps_progress_before_failure<FS, S, FC, C>(
    make_store: FS,
    make_checkpoints: FC,
) -> ContractTestResult
where
    FS: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
    FC: Fn(SubscriberId) -> C + Send + Sync + Clone + 'static,
    C: CheckpointStorage + 'static,
{
    const SCENARIO: &str = "catch_up_keeps_progress_before_failure";

    let store = make_store();
    setup_store(SCENARIO, &store).await?;
    let checkpoints = make_checkpoints(unique_subscriber(SCENARIO)?);
    setup_checkpoint(SCENARIO, &checkpoints).await?;
    let token = unique_token(SCENARIO);

    let category = seed_category(SCENARIO, &store, &token, &["a", "b", "poison", "c"]).await?;
    let runner =
        CatchUp::new(&store, &checkpoints).with_selector(StreamSelector::category(category));

    let mut failing = RecordingHandler {
        fail_on: Some("poison".to_owned()),
        ..RecordingHandler::default()
    };
    let failed_at = match runner.run(&mut failing).await {
        Err(CatchUpError::Handler { sequence_number, .. }) => sequence_number,
        other => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("poisoned event should fail the run, got {other:?}"),
            ))
        }
    };

    let stored = checkpoints
        .get_highest_applied_sequence_number()
        .await
        .map_err(|error| {
            ContractTestFailure::store_error(SCENARIO, "get_highest_applied_sequence_number", error)
        })?;
    ensure(SCENARIO, stored < failed_at && stored > SequenceNumber::none(), || {
        format!("stored {stored}, expected progress just before the failed event at {failed_at}")
    })?;

    let mut healed = RecordingHandler::default();
    let _ = runner
        .run(&mut healed)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "catch_up", error))?;
    ensure(SCENARIO, healed.seen == ["poison", "c"], || {
        format!("retry after failure applied {:?}", healed.seen)
    })
}

/// Stamp out the catch-up scenarios for a store and checkpoint backend pair.
#[macro_export]
macro_rules! catch_up_contract_tests {
    (
        suite = $suite:ident,
        make_store = $make_store:expr,
        make_checkpoints = $make_checkpoints:expr $(,)?
    ) => {
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_catch_up_keeps_progress_before_failure, test_catch_up_resumes_from_checkpoint,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn catch_up_resumes_from_checkpoint_contract() {
                test_catch_up_resumes_from_checkpoint($make_store, $make_checkpoints)
                    .await
                    .expect("catch-up contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn catch_up_keeps_progress_before_failure_contract() {
                test_catch_up_keeps_progress_before_failure($make_store, $make_checkpoints)
                    .await
                    .expect("catch-up contract failed");
            }
        }
    };
}

pub use catch_up_contract_tests;
