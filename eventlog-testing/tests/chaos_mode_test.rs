use eventlog::{
    CheckpointError, CheckpointStorage, ConcurrencyError, Event, EventStore, EventStoreError,
    EventType, Events, ExpectedVersion, Operation, StreamName, SubscriberId,
};
use eventlog_memory::{InMemoryCheckpoints, InMemoryEventStore};
use eventlog_testing::chaos::{ChaosCheckpointStorage, ChaosConfig, ChaosEventStoreExt};
use futures::TryStreamExt;

fn stream(name: &str) -> StreamName {
    StreamName::try_new(name).expect("valid stream name")
}

fn one_event() -> Events {
    Events::single(Event::new(
        EventType::try_new("Chaos:Happened").expect("valid event type"),
        "{}",
    ))
}

#[tokio::test]
async fn chaos_mode_can_force_load_failure() {
    // Given: deterministic chaos forcing every operation to fail
    let base_store = InMemoryEventStore::new();
    let _ = base_store.setup().await.expect("setup succeeds");
    let chaos_store =
        base_store.with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));

    // When: loading a stream through the chaos-enabled store
    let error = chaos_store
        .load(stream("chaos-read-stream"), None)
        .try_collect::<Vec<_>>()
        .await
        .expect_err("chaos-enabled load should fail");

    // Then: the failure names the load operation
    assert!(matches!(
        error,
        EventStoreError::StoreFailure {
            operation: Operation::Load,
            ..
        }
    ));
}

#[tokio::test]
async fn chaos_mode_can_force_version_conflict_on_commit() {
    // Given: deterministic chaos forcing every commit to conflict
    let base_store = InMemoryEventStore::new();
    let _ = base_store.setup().await.expect("setup succeeds");
    let chaos_store =
        base_store.with_chaos(ChaosConfig::deterministic().with_version_conflict_probability(1.0));

    // When: committing to an empty stream
    let error = chaos_store
        .commit(stream("chaos-write-stream"), one_event(), ExpectedVersion::NoStream)
        .await
        .expect_err("chaos-enabled commit should conflict");

    // Then: the caller sees a concurrency error and nothing was written
    assert!(matches!(
        error,
        EventStoreError::Concurrency(ConcurrencyError::RetriesExhausted { .. })
    ));
    let stored: Vec<_> = chaos_store
        .inner()
        .load(stream("chaos-write-stream"), None)
        .try_collect()
        .await
        .expect("load succeeds");
    assert!(stored.is_empty());
}

#[tokio::test]
async fn chaos_mode_names_the_failed_commit_operation() {
    let base_store = InMemoryEventStore::new();
    let _ = base_store.setup().await.expect("setup succeeds");
    let chaos_store =
        base_store.with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));

    let error = chaos_store
        .commit(stream("chaos-insert-stream"), one_event(), ExpectedVersion::Any)
        .await
        .expect_err("chaos-enabled commit should fail");

    assert_eq!(error.to_string(), "storage failure during insert: injected by chaos");
}

#[tokio::test]
async fn zero_probability_passes_through() {
    let chaos_store = InMemoryEventStore::new().with_chaos(ChaosConfig::default());
    let _ = chaos_store.setup().await.expect("setup succeeds");

    let committed = chaos_store
        .commit(stream("chaos-passthrough"), one_event(), ExpectedVersion::NoStream)
        .await;
    let loaded: Result<Vec<_>, _> = chaos_store
        .load(stream("chaos-passthrough"), None)
        .try_collect()
        .await;

    assert!(committed.is_ok());
    assert_eq!(loaded.map(|events| events.len()), Ok(1));
}

#[tokio::test]
async fn chaos_mode_can_simulate_a_competing_subscriber() {
    // Given: a checkpoint that another instance appears to hold
    let registry = InMemoryCheckpoints::new();
    let subscriber_id = SubscriberId::try_new("chaos-projector").expect("valid subscriber id");
    let checkpoints = ChaosCheckpointStorage::new(
        registry.storage(subscriber_id.clone()),
        ChaosConfig::deterministic().with_lock_contention_probability(1.0),
    );
    let _ = checkpoints.setup().await.expect("setup succeeds");

    // When / Then: acquiring reports contention, not a failure of the store
    assert_eq!(
        checkpoints.acquire_lock().await,
        Err(CheckpointError::LockUnavailable { subscriber_id })
    );
}
