//! Failure injection around real backends.
//!
//! The wrappers forward to the wrapped store and, at configured rates,
//! fail instead with the errors a flaky database or a competing instance
//! would produce.

use std::future::Future;

use eventlog::{
    CheckpointError, CheckpointStorage, CommitResult, ConcurrencyError, EventStore,
    EventStoreError, EventStream, Events, ExpectedVersion, LoadQuery, Operation, SequenceNumber,
    SetupReport, StoreStatus, StreamName, SubscriberId,
};
use futures::{stream, StreamExt};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};

const INJECTED: &str = "injected by chaos";

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```
/// use eventlog_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// assert!(Probability::try_new(-0.1).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(probability: f32) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        Self::try_new(probability)
            .unwrap_or_else(|_| unreachable!("a clamped probability is always in range"))
    }

    fn never() -> Self {
        Self::clamped(0.0)
    }
}

/// Injection rates and seed shared by the chaos wrappers.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    version_conflict_probability: Probability,
    lock_contention_probability: Probability,
}

impl ChaosConfig {
    /// Fixed seed, so that a test sees the same injections on every run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Chance that an operation fails with a storage failure.
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Chance that a commit reports exhausted conflict retries.
    pub fn with_version_conflict_probability(mut self, probability: f32) -> Self {
        self.version_conflict_probability = Probability::clamped(probability);
        self
    }

    /// Chance that `acquire_lock` reports the lock as held elsewhere.
    pub fn with_lock_contention_probability(mut self, probability: f32) -> Self {
        self.lock_contention_probability = Probability::clamped(probability);
        self
    }

    fn rng(&self) -> Mutex<StdRng> {
        let seed = self.deterministic_seed.unwrap_or_else(random);
        Mutex::new(StdRng::seed_from_u64(seed))
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::never(),
            version_conflict_probability: Probability::never(),
            lock_contention_probability: Probability::never(),
        }
    }
}

fn should_inject(rng: &Mutex<StdRng>, probability: Probability) -> bool {
    let probability: f32 = probability.into();
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rng.lock().random_bool(f64::from(probability))
}

/// Wrap any event store with `.with_chaos(config)`.
pub trait ChaosEventStoreExt: Sized {
    /// Wrap `self` in a [`ChaosEventStore`].
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventStore<Self>;
}

/// Event store wrapper that fails loads and commits at configurable rates.
pub struct ChaosEventStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosEventStore<S> {
    /// Wrap `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = config.rng();
        Self { store, config, rng }
    }

    /// The wrapped store, for assertions that bypass injection.
    pub fn inner(&self) -> &S {
        &self.store
    }

    fn inject(&self, probability: Probability) -> bool {
        should_inject(&self.rng, probability)
    }
}

impl<S: EventStore> EventStore for ChaosEventStore<S> {
    fn setup(&self) -> impl Future<Output = Result<SetupReport, EventStoreError>> + Send {
        self.store.setup()
    }

    fn status(&self) -> impl Future<Output = StoreStatus> + Send {
        self.store.status()
    }

    fn load_query(&self, query: LoadQuery) -> EventStream {
        if self.inject(self.config.failure_probability) {
            let error = EventStoreError::store_failure(Operation::Load, INJECTED);
            return stream::iter([Err(error)]).boxed();
        }
        self.store.load_query(query)
    }

    fn commit(
        &self,
        stream: StreamName,
        events: Events,
        expected: ExpectedVersion,
    ) -> impl Future<Output = Result<CommitResult, EventStoreError>> + Send {
        let should_conflict = self.inject(self.config.version_conflict_probability);
        let should_fail = self.inject(self.config.failure_probability);
        let store = &self.store;

        async move {
            if should_conflict {
                return Err(EventStoreError::from(ConcurrencyError::RetriesExhausted {
                    stream,
                    attempts: 0,
                }));
            }
            if should_fail {
                return Err(EventStoreError::store_failure(Operation::Insert, INJECTED));
            }
            store.commit(stream, events, expected).await
        }
    }

    fn delete_stream(
        &self,
        stream: &StreamName,
    ) -> impl Future<Output = Result<(), EventStoreError>> + Send {
        let should_fail = self.inject(self.config.failure_probability);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(EventStoreError::store_failure(Operation::DeleteStream, INJECTED));
            }
            store.delete_stream(stream).await
        }
    }
}

impl<S: EventStore> ChaosEventStoreExt for S {
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventStore<Self> {
        ChaosEventStore::new(self, config)
    }
}

/// Checkpoint storage wrapper simulating a competing instance and flaky
/// storage.
pub struct ChaosCheckpointStorage<C> {
    checkpoints: C,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<C: CheckpointStorage> ChaosCheckpointStorage<C> {
    /// Wrap `checkpoints`.
    pub fn new(checkpoints: C, config: ChaosConfig) -> Self {
        let rng = config.rng();
        Self {
            checkpoints,
            config,
            rng,
        }
    }

    fn store_failure(&self, operation: Operation) -> CheckpointError {
        CheckpointError::StoreFailure {
            subscriber_id: self.checkpoints.subscriber_id().clone(),
            operation,
            detail: INJECTED.to_owned(),
        }
    }
}

impl<C: CheckpointStorage> CheckpointStorage for ChaosCheckpointStorage<C> {
    fn subscriber_id(&self) -> &SubscriberId {
        self.checkpoints.subscriber_id()
    }

    fn setup(&self) -> impl Future<Output = Result<SetupReport, CheckpointError>> + Send {
        self.checkpoints.setup()
    }

    fn status(&self) -> impl Future<Output = StoreStatus> + Send {
        self.checkpoints.status()
    }

    fn acquire_lock(&self) -> impl Future<Output = Result<SequenceNumber, CheckpointError>> + Send {
        let contended = should_inject(&self.rng, self.config.lock_contention_probability);
        let failure = should_inject(&self.rng, self.config.failure_probability)
            .then(|| self.store_failure(Operation::AcquireLock));
        let subscriber_id = self.checkpoints.subscriber_id().clone();
        let checkpoints = &self.checkpoints;

        async move {
            if contended {
                return Err(CheckpointError::LockUnavailable { subscriber_id });
            }
            if let Some(error) = failure {
                return Err(error);
            }
            checkpoints.acquire_lock().await
        }
    }

    fn update_and_release_lock(
        &self,
        sequence_number: SequenceNumber,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send {
        self.checkpoints.update_and_release_lock(sequence_number)
    }

    fn get_highest_applied_sequence_number(
        &self,
    ) -> impl Future<Output = Result<SequenceNumber, CheckpointError>> + Send {
        let failure = should_inject(&self.rng, self.config.failure_probability)
            .then(|| self.store_failure(Operation::ReadCheckpoint));
        let checkpoints = &self.checkpoints;

        async move {
            match failure {
                Some(error) => Err(error),
                None => checkpoints.get_highest_applied_sequence_number().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog_memory::InMemoryEventStore;

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn out_of_range_probabilities_are_clamped() {
        let config = ChaosConfig::default()
            .with_failure_probability(7.0)
            .with_version_conflict_probability(-1.0);

        assert_eq!(f32::from(config.failure_probability), 1.0);
        assert_eq!(f32::from(config.version_conflict_probability), 0.0);
    }

    #[test]
    fn deterministic_seed_gives_repeatable_decisions() {
        let config = ChaosConfig::deterministic().with_failure_probability(0.5);
        let decide = || {
            let chaos = ChaosEventStore::new(InMemoryEventStore::new(), config.clone());
            (0..32)
                .map(|_| chaos.inject(chaos.config.failure_probability))
                .collect::<Vec<_>>()
        };

        assert_eq!(decide(), decide());
    }
}
