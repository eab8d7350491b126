//! Per-subscriber checkpoint rows guarded by row locks.
//!
//! The lock is an open transaction holding `FOR UPDATE NOWAIT` on the
//! subscriber's row. It lives inside the storage instance until
//! `update_and_release_lock` commits it; dropping the instance drops the
//! transaction, and the database rolls it back and frees the row.

use std::num::NonZeroU32;

use eventlog::{
    CheckpointError, CheckpointStorage, Operation, ProtocolViolation, SequenceNumber,
    SetupReport, StoreStatus, SubscriberId,
};
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::config::{PostgresCheckpointConfig, TableName};
use crate::error::{map_checkpoint_error, PostgresEventStoreError};
use crate::schema::{self, TableDefinition};

struct HeldLock {
    tx: Transaction<'static, Postgres>,
    acquired: SequenceNumber,
}

/// Checkpoint of one subscriber in a PostgreSQL table.
///
/// Every instance is an independent lock holder; two instances for the
/// same subscriber exclude each other even inside one process.
pub struct PostgresCheckpointStorage {
    pool: PgPool,
    table: TableName,
    subscriber_id: SubscriberId,
    lock: Mutex<Option<HeldLock>>,
}

impl std::fmt::Debug for PostgresCheckpointStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCheckpointStorage")
            .field("table", &self.table)
            .field("subscriber_id", &self.subscriber_id)
            .field("locked", &self.lock.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresCheckpointStorage {
    /// Connect with the default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
        subscriber_id: SubscriberId,
    ) -> Result<Self, PostgresEventStoreError> {
        Self::with_config(
            connection_string,
            subscriber_id,
            PostgresCheckpointConfig::default(),
        )
        .await
    }

    /// Connect with a pool sized and timed by `config`, using its table.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        subscriber_id: SubscriberId,
        config: PostgresCheckpointConfig,
    ) -> Result<Self, PostgresEventStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .test_before_acquire(true)
            .connect(&connection_string)
            .await
            .map_err(PostgresEventStoreError::ConnectionFailed)?;
        Ok(Self::from_pool(pool, subscriber_id).with_table(config.table))
    }

    /// Use an existing pool, e.g. the one of a `PostgresEventStore`.
    pub fn from_pool(pool: PgPool, subscriber_id: SubscriberId) -> Self {
        Self {
            pool,
            table: TableName::default_checkpoints(),
            subscriber_id,
            lock: Mutex::new(None),
        }
    }

    /// Keep checkpoints in `table` instead of `eventlog_checkpoints`.
    pub fn with_table(mut self, table: TableName) -> Self {
        self.table = table;
        self
    }

    /// Table holding the checkpoints.
    pub fn table(&self) -> &TableName {
        &self.table
    }

    fn error(&self, error: sqlx::Error, operation: Operation) -> CheckpointError {
        map_checkpoint_error(error, &self.table, &self.subscriber_id, operation)
    }

    fn protocol(&self, violation: ProtocolViolation) -> CheckpointError {
        CheckpointError::Protocol {
            subscriber_id: self.subscriber_id.clone(),
            violation,
        }
    }

    fn store_failure(&self, operation: Operation, detail: String) -> CheckpointError {
        CheckpointError::StoreFailure {
            subscriber_id: self.subscriber_id.clone(),
            operation,
            detail,
        }
    }

    fn uninitialized(&self) -> CheckpointError {
        CheckpointError::Uninitialized {
            subscriber_id: self.subscriber_id.clone(),
        }
    }

    async fn row_exists(&self) -> Result<bool, sqlx::Error> {
        let sql = format!("SELECT 1 FROM {} WHERE subscriber_id = $1", self.table);
        let row: Option<i32> = sqlx::query_scalar(&sql)
            .bind(self.subscriber_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

/// Stored positions are `BIGINT`; a negative one is corruption, not zero.
fn to_sequence_number(raw: i64) -> Result<SequenceNumber, String> {
    u64::try_from(raw)
        .map(SequenceNumber::new)
        .map_err(|_| format!("stored checkpoint {raw} is negative"))
}

fn to_bigint(sequence_number: SequenceNumber) -> Result<i64, String> {
    i64::try_from(sequence_number.into_inner())
        .map_err(|_| format!("{sequence_number} exceeds BIGINT"))
}

async fn discard(tx: Transaction<'static, Postgres>) {
    if let Err(error) = tx.rollback().await {
        warn!(error = %error, "[postgres.checkpoint_rollback_failed] rollback failed");
    }
}

impl CheckpointStorage for PostgresCheckpointStorage {
    fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    #[instrument(
        name = "postgres.checkpoint_setup",
        skip(self),
        fields(subscriber = %self.subscriber_id)
    )]
    async fn setup(&self) -> Result<SetupReport, CheckpointError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| self.error(error, Operation::Setup))?;

        let mut report = schema::apply(&mut tx, &TableDefinition::checkpoints(&self.table))
            .await
            .map_err(|error| self.error(error, Operation::Setup))?;

        let sql = format!(
            "INSERT INTO {} (subscriber_id, applied_sequence_number) VALUES ($1, 0) \
             ON CONFLICT (subscriber_id) DO NOTHING",
            self.table
        );
        let inserted = sqlx::query(&sql)
            .bind(self.subscriber_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|error| self.error(error, Operation::Setup))?
            .rows_affected();
        if inserted > 0 {
            report.record(format!("initialized checkpoint of {}", self.subscriber_id));
        }

        tx.commit()
            .await
            .map_err(|error| self.error(error, Operation::Setup))?;
        info!("[postgres.checkpoint_setup] {report}");
        Ok(report)
    }

    async fn status(&self) -> StoreStatus {
        let pending =
            schema::pending_changes(&self.pool, &TableDefinition::checkpoints(&self.table)).await;
        let status = schema::status_from(&self.table, pending);
        if !status.is_ok() {
            return status;
        }
        match self.row_exists().await {
            Ok(true) => StoreStatus::Ok {
                details: format!("checkpoint of {} ready", self.subscriber_id),
            },
            Ok(false) => StoreStatus::SetupRequired {
                details: format!("checkpoint of {} is not initialized", self.subscriber_id),
            },
            Err(error) => StoreStatus::Error {
                details: error.to_string(),
            },
        }
    }

    #[instrument(
        name = "postgres.acquire_lock",
        skip(self),
        fields(subscriber = %self.subscriber_id)
    )]
    async fn acquire_lock(&self) -> Result<SequenceNumber, CheckpointError> {
        if self.lock.lock().is_some() {
            return Err(self.protocol(ProtocolViolation::LockAlreadyHeld));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| self.error(error, Operation::AcquireLock))?;
        let sql = format!(
            "SELECT applied_sequence_number FROM {} WHERE subscriber_id = $1 FOR UPDATE NOWAIT",
            self.table
        );
        let locked: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(&sql)
            .bind(self.subscriber_id.as_str())
            .fetch_optional(&mut *tx)
            .await;

        let acquired = match locked.map(|row| row.map(to_sequence_number)) {
            Ok(Some(Ok(acquired))) => acquired,
            Ok(Some(Err(detail))) => {
                discard(tx).await;
                return Err(self.store_failure(Operation::AcquireLock, detail));
            }
            Ok(None) => {
                discard(tx).await;
                return Err(self.uninitialized());
            }
            Err(error) => {
                discard(tx).await;
                return Err(self.error(error, Operation::AcquireLock));
            }
        };

        let rejected = {
            let mut slot = self.lock.lock();
            if slot.is_some() {
                Some(tx)
            } else {
                *slot = Some(HeldLock { tx, acquired });
                None
            }
        };
        if let Some(tx) = rejected {
            discard(tx).await;
            return Err(self.protocol(ProtocolViolation::LockAlreadyHeld));
        }

        debug!(position = %acquired, "[postgres.lock_acquired] checkpoint locked");
        Ok(acquired)
    }

    #[instrument(
        name = "postgres.update_and_release_lock",
        skip(self),
        fields(subscriber = %self.subscriber_id)
    )]
    async fn update_and_release_lock(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let held = self.lock.lock().take();
        let Some(HeldLock { mut tx, acquired }) = held else {
            return Err(self.protocol(ProtocolViolation::LockNotHeld));
        };
        let persist_failed = |error: &dyn std::fmt::Display| {
            warn!(
                error = %error,
                sequence_number = %sequence_number,
                "[postgres.checkpoint_persist_failed] checkpoint not stored"
            );
            CheckpointError::PersistFailed {
                subscriber_id: self.subscriber_id.clone(),
                sequence_number,
                detail: error.to_string(),
            }
        };

        if sequence_number == acquired {
            return tx.rollback().await.map_err(|error| persist_failed(&error));
        }
        let raw = match to_bigint(sequence_number) {
            Ok(raw) => raw,
            Err(detail) => {
                discard(tx).await;
                return Err(persist_failed(&detail));
            }
        };

        let sql = format!(
            "UPDATE {} SET applied_sequence_number = $2 WHERE subscriber_id = $1",
            self.table
        );
        if let Err(error) = sqlx::query(&sql)
            .bind(self.subscriber_id.as_str())
            .bind(raw)
            .execute(&mut *tx)
            .await
        {
            discard(tx).await;
            return Err(persist_failed(&error));
        }
        tx.commit().await.map_err(|error| persist_failed(&error))?;
        debug!(
            from = %acquired,
            to = %sequence_number,
            "[postgres.checkpoint_stored] checkpoint advanced"
        );
        Ok(())
    }

    async fn get_highest_applied_sequence_number(&self) -> Result<SequenceNumber, CheckpointError> {
        let sql = format!(
            "SELECT applied_sequence_number FROM {} WHERE subscriber_id = $1",
            self.table
        );
        let stored: Option<i64> = sqlx::query_scalar(&sql)
            .bind(self.subscriber_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| self.error(error, Operation::ReadCheckpoint))?;
        let raw = stored.ok_or_else(|| self.uninitialized())?;
        to_sequence_number(raw)
            .map_err(|detail| self.store_failure(Operation::ReadCheckpoint, detail))
    }
}

impl Drop for PostgresCheckpointStorage {
    fn drop(&mut self) {
        if self.lock.get_mut().is_some() {
            warn!(
                subscriber = %self.subscriber_id,
                "[postgres.lock_abandoned] dropping checkpoint storage while holding the lock; \
                 the transaction is rolled back"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_stored_position_is_not_read_as_zero() {
        assert_eq!(to_sequence_number(0), Ok(SequenceNumber::none()));
        assert_eq!(to_sequence_number(42), Ok(SequenceNumber::new(42)));
        assert_eq!(
            to_sequence_number(-1),
            Err("stored checkpoint -1 is negative".to_owned())
        );
    }

    #[test]
    fn positions_beyond_bigint_are_rejected() {
        let largest = SequenceNumber::new(i64::MAX.unsigned_abs());

        assert_eq!(to_bigint(largest), Ok(i64::MAX));
        assert!(to_bigint(SequenceNumber::new(u64::MAX)).is_err());
    }
}
