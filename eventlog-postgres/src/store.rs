use std::num::NonZeroU32;
use std::sync::Arc;

use eventlog::{
    paginate, Clock, CommitProtocol, CommitResult, EventStore, EventStoreError, EventStream,
    Events, ExpectedVersion, LoadQuery, Operation, ReadBatchSize, SetupReport, StoreStatus,
    StreamName,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{query, PgPool};
use tracing::{info, instrument};

use crate::config::{PostgresConfig, TableName};
use crate::error::{map_sqlx_error, PostgresEventStoreError};
use crate::reader::PostgresPages;
use crate::schema::{self, TableDefinition};
use crate::session::PostgresCommitSession;

/// Event log stored in one PostgreSQL table.
///
/// Clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    table: TableName,
    protocol: CommitProtocol,
    read_batch_size: ReadBatchSize,
}

fn pool_options(config: &PostgresConfig) -> PgPoolOptions {
    let max_connections: NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .test_before_acquire(true)
}

impl PostgresEventStore {
    /// Create a new PostgresEventStore with default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresEventStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new PostgresEventStore with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresEventStoreError> {
        let connection_string = connection_string.into();
        let pool = pool_options(&config)
            .connect(&connection_string)
            .await
            .map_err(PostgresEventStoreError::ConnectionFailed)?;
        Ok(Self::from_pool_with_config(pool, config))
    }

    /// Build the store without connecting; the first operation opens the
    /// first connection.
    pub fn connect_lazy<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresEventStoreError> {
        let connection_string = connection_string.into();
        let pool = pool_options(&config)
            .connect_lazy(&connection_string)
            .map_err(PostgresEventStoreError::ConnectionFailed)?;
        Ok(Self::from_pool_with_config(pool, config))
    }

    /// Create a PostgresEventStore from an existing connection pool.
    ///
    /// Use this when you need full control over pool configuration or want to
    /// share a pool across multiple components.
    pub fn from_pool(pool: PgPool) -> Self {
        Self::from_pool_with_config(pool, PostgresConfig::default())
    }

    /// Like [`from_pool`](Self::from_pool), taking table, batch size and
    /// retry policy from `config`. Pool settings in `config` are ignored.
    pub fn from_pool_with_config(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            table: config.event_table,
            protocol: CommitProtocol::new(config.commit_retry),
            read_batch_size: config.read_batch_size,
        }
    }

    /// Use `clock` for the `recorded_at` timestamp of new events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.protocol = self.protocol.with_clock(clock);
        self
    }

    /// The underlying pool, e.g. to share it with [`crate::PostgresCheckpointStorage`].
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Table holding the events.
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Open a fresh session for use with [`CommitProtocol::commit`].
    pub fn session(&self) -> PostgresCommitSession {
        PostgresCommitSession::new(self.pool.clone(), self.table.clone())
    }
}

impl EventStore for PostgresEventStore {
    #[instrument(name = "postgres.setup", skip(self), fields(table = %self.table))]
    async fn setup(&self) -> Result<SetupReport, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, &self.table, Operation::Setup))?;
        let report = schema::apply(&mut tx, &TableDefinition::events(&self.table))
            .await
            .map_err(|error| map_sqlx_error(error, &self.table, Operation::Setup))?;
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, &self.table, Operation::Setup))?;

        info!("[postgres.setup] {report}");
        Ok(report)
    }

    async fn status(&self) -> StoreStatus {
        let pending =
            schema::pending_changes(&self.pool, &TableDefinition::events(&self.table)).await;
        schema::status_from(&self.table, pending)
    }

    fn load_query(&self, query: LoadQuery) -> EventStream {
        let pages = PostgresPages {
            pool: self.pool.clone(),
            table: self.table.clone(),
        };
        paginate(pages, query, self.read_batch_size)
    }

    #[instrument(name = "postgres.commit", skip(self, events), fields(table = %self.table))]
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

    #[instrument(name = "postgres.delete_stream", skip(self), fields(table = %self.table))]
    async fn delete_stream(&self, stream: &StreamName) -> Result<(), EventStoreError> {
        let sql = format!("DELETE FROM {} WHERE stream = $1", self.table);
        let deleted = query(&sql)
            .bind(stream.as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, &self.table, Operation::DeleteStream))?
            .rows_affected();

        info!(deleted, "[postgres.delete_stream] stream removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog::CommitRetryPolicy;

    #[tokio::test]
    async fn lazy_store_takes_table_and_policy_from_config() {
        let config = PostgresConfig {
            event_table: TableName::try_new("ledger").expect("valid table name"),
            commit_retry: CommitRetryPolicy {
                initial_backoff_ms: 1,
                max_retries: 2,
            },
            ..PostgresConfig::default()
        };

        let store =
            PostgresEventStore::connect_lazy("postgres://postgres@127.0.0.1:1/unused", config)
            .expect("lazy pool");

        assert_eq!(store.table().as_str(), "ledger");
        assert_eq!(store.protocol.policy().max_retries, 2);
    }

    #[tokio::test]
    async fn unreachable_database_reports_status_error() {
        let config = PostgresConfig {
            acquire_timeout: std::time::Duration::from_millis(200),
            ..PostgresConfig::default()
        };
        let store =
            PostgresEventStore::connect_lazy("postgres://postgres@127.0.0.1:1/unused", config)
            .expect("lazy pool");

        let status = store.status().await;

        assert!(matches!(status, StoreStatus::Error { .. }));
    }
}
