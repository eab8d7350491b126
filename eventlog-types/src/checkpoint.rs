use crate::setup::{SetupReport, StoreStatus};
use crate::store::Operation;
use crate::validation::no_control_characters;
use crate::version::SequenceNumber;
use nutype::nutype;
use std::fmt;
use std::future::Future;

/// Identifier of a catch-up subscriber; one checkpoint row per subscriber.
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
pub struct SubscriberId(String);

impl SubscriberId {
    /// The identifier as text.
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Misuse of the acquire/release protocol by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `acquire_lock` was called while this instance already held the lock.
    LockAlreadyHeld,
    /// `update_and_release_lock` was called without holding the lock.
    LockNotHeld,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockAlreadyHeld => write!(f, "lock is already held by this instance"),
            Self::LockNotHeld => write!(f, "lock is not held by this instance"),
        }
    }
}

/// Errors returned by [`CheckpointStorage`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// Another session holds the checkpoint lock right now.
    #[error("checkpoint of {subscriber_id} is locked by another session")]
    LockUnavailable { subscriber_id: SubscriberId },

    /// No checkpoint row exists; run `setup()` first.
    #[error("checkpoint of {subscriber_id} is not initialized")]
    Uninitialized { subscriber_id: SubscriberId },

    /// The caller broke the acquire/release protocol.
    #[error("checkpoint protocol violation for {subscriber_id}: {violation}")]
    Protocol {
        subscriber_id: SubscriberId,
        violation: ProtocolViolation,
    },

    /// The new position could not be written; the transaction was rolled back.
    #[error("failed to persist checkpoint {sequence_number} of {subscriber_id}: {detail}")]
    PersistFailed {
        subscriber_id: SubscriberId,
        sequence_number: SequenceNumber,
        detail: String,
    },

    /// The storage engine failed outside of persisting a new position.
    #[error("storage failure during {operation} for {subscriber_id}: {detail}")]
    StoreFailure {
        subscriber_id: SubscriberId,
        operation: Operation,
        detail: String,
    },
}

/// Per-subscriber record of the highest applied sequence number, guarded by
/// an exclusive, non-blocking lock.
///
/// A catch-up consumer calls [`acquire_lock`](Self::acquire_lock), applies
/// events after the returned position and finishes with
/// [`update_and_release_lock`](Self::update_and_release_lock). Only one
/// session at a time can hold the lock of a subscriber. A lock held by an
/// instance that is dropped is released.
pub trait CheckpointStorage: Send + Sync {
    /// Subscriber whose checkpoint this instance manages.
    fn subscriber_id(&self) -> &SubscriberId;

    /// Create the checkpoint table if needed and the zero row for this
    /// subscriber. Idempotent, also under concurrent callers.
    fn setup(&self) -> impl Future<Output = Result<SetupReport, CheckpointError>> + Send;

    /// Report whether the table and this subscriber's row exist, without
    /// changing anything.
    fn status(&self) -> impl Future<Output = StoreStatus> + Send;

    /// Take the lock without waiting and return the stored position.
    fn acquire_lock(&self) -> impl Future<Output = Result<SequenceNumber, CheckpointError>> + Send;

    /// Persist `sequence_number` (if it changed) and release the lock.
    ///
    /// The local lock state is cleared even when persisting fails.
    fn update_and_release_lock(
        &self,
        sequence_number: SequenceNumber,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Read the stored position without taking the lock.
    fn get_highest_applied_sequence_number(
        &self,
    ) -> impl Future<Output = Result<SequenceNumber, CheckpointError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_id_rejects_control_characters() {
        assert!(SubscriberId::try_new("projector\n").is_err());
        assert!(SubscriberId::try_new("projector").is_ok());
    }

    #[test]
    fn protocol_error_names_subscriber_and_violation() {
        let error = CheckpointError::Protocol {
            subscriber_id: SubscriberId::try_new("projector").expect("valid subscriber id"),
            violation: ProtocolViolation::LockNotHeld,
        };

        assert_eq!(
            error.to_string(),
            "checkpoint protocol violation for projector: lock is not held by this instance"
        );
    }
}
