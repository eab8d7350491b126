//! SQLSTATE classification of driver errors.

use eventlog::{CheckpointError, EventStoreError, Operation, SubscriberId, WriteFailure};
use thiserror::Error;
use tracing::{error, warn};

use crate::config::TableName;

/// Errors raised while constructing a PostgreSQL backend.
#[derive(Debug, Error)]
pub enum PostgresEventStoreError {
    /// The pool could not connect or the connection string is invalid.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
}

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// What a database error means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    VersionConflict,
    DuplicateEventId,
    Transient,
    SchemaMissing,
    LockNotAvailable,
    Other,
}

pub(crate) fn stream_version_index(table: &TableName) -> String {
    format!("{table}_stream_version_key")
}

pub(crate) fn id_index(table: &TableName) -> String {
    format!("{table}_id_key")
}

pub(crate) fn correlation_id_index(table: &TableName) -> String {
    format!("{table}_correlation_id_idx")
}

pub(crate) fn classify(code: Option<&str>, constraint: Option<&str>, table: &TableName) -> Failure {
    match code {
        Some(UNIQUE_VIOLATION) => match constraint {
            Some(name) if name == stream_version_index(table) => Failure::VersionConflict,
            Some(name) if name == id_index(table) => Failure::DuplicateEventId,
            _ => Failure::Other,
        },
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => Failure::Transient,
        Some(UNDEFINED_TABLE | UNDEFINED_COLUMN) => Failure::SchemaMissing,
        Some(LOCK_NOT_AVAILABLE) => Failure::LockNotAvailable,
        _ => Failure::Other,
    }
}

fn classify_error(error: &sqlx::Error, table: &TableName) -> Failure {
    match error.as_database_error() {
        Some(db_error) => classify(db_error.code().as_deref(), db_error.constraint(), table),
        None => Failure::Other,
    }
}

/// Map a failure inside the commit transaction for the retry loop.
pub(crate) fn write_failure(
    error: sqlx::Error,
    table: &TableName,
    operation: Operation,
) -> WriteFailure {
    let detail = error.to_string();
    match classify_error(&error, table) {
        Failure::VersionConflict => {
            warn!(
                error = %detail,
                "[postgres.version_conflict] optimistic concurrency check failed"
            );
            WriteFailure::VersionConflict { detail }
        }
        Failure::Transient => {
            warn!(error = %detail, "[postgres.transient] serialization failure or deadlock");
            WriteFailure::Transient { detail }
        }
        Failure::DuplicateEventId => WriteFailure::DuplicateEventId { detail },
        Failure::SchemaMissing => WriteFailure::SetupRequired { detail },
        Failure::LockNotAvailable | Failure::Other => {
            error!(
                error = %detail,
                operation = %operation,
                "[postgres.database_error] database operation failed"
            );
            WriteFailure::storage(operation, detail)
        }
    }
}

pub(crate) fn map_sqlx_error(
    error: sqlx::Error,
    table: &TableName,
    operation: Operation,
) -> EventStoreError {
    if classify_error(&error, table) == Failure::SchemaMissing {
        return EventStoreError::SetupRequired {
            detail: error.to_string(),
        };
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    EventStoreError::store_failure(operation, error)
}

pub(crate) fn map_checkpoint_error(
    error: sqlx::Error,
    table: &TableName,
    subscriber_id: &SubscriberId,
    operation: Operation,
) -> CheckpointError {
    match classify_error(&error, table) {
        Failure::LockNotAvailable => {
            warn!(
                subscriber = %subscriber_id,
                "[postgres.lock_unavailable] checkpoint row locked by another session"
            );
            CheckpointError::LockUnavailable {
                subscriber_id: subscriber_id.clone(),
            }
        }
        Failure::SchemaMissing => CheckpointError::Uninitialized {
            subscriber_id: subscriber_id.clone(),
        },
        _ => {
            error!(
                error = %error,
                operation = %operation,
                subscriber = %subscriber_id,
                "[postgres.database_error] checkpoint operation failed"
            );
            CheckpointError::StoreFailure {
                subscriber_id: subscriber_id.clone(),
                operation,
                detail: error.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableName {
        TableName::try_new("ledger").expect("valid table name")
    }

    #[test]
    fn unique_violations_are_told_apart_by_index() {
        let table = table();

        assert_eq!(
            classify(Some("23505"), Some("ledger_stream_version_key"), &table),
            Failure::VersionConflict
        );
        assert_eq!(
            classify(Some("23505"), Some("ledger_id_key"), &table),
            Failure::DuplicateEventId
        );
        assert_eq!(
            classify(Some("23505"), Some("other_id_key"), &table),
            Failure::Other
        );
        assert_eq!(classify(Some("23505"), None, &table), Failure::Other);
    }

    #[test]
    fn serialization_failures_and_deadlocks_are_transient() {
        let table = table();

        assert_eq!(classify(Some("40001"), None, &table), Failure::Transient);
        assert_eq!(classify(Some("40P01"), None, &table), Failure::Transient);
    }

    #[test]
    fn remaining_codes() {
        let table = table();

        assert_eq!(classify(Some("42P01"), None, &table), Failure::SchemaMissing);
        assert_eq!(classify(Some("55P03"), None, &table), Failure::LockNotAvailable);
        assert_eq!(classify(Some("08006"), None, &table), Failure::Other);
        assert_eq!(classify(None, None, &table), Failure::Other);
    }

    #[test]
    fn pool_errors_are_not_retryable() {
        let failure =
            write_failure(sqlx::Error::PoolTimedOut, &table(), Operation::BeginTransaction);

        assert!(!failure.is_retryable());
        assert!(matches!(
            failure,
            WriteFailure::Storage {
                operation: Operation::BeginTransaction,
                ..
            }
        ));
    }
}
