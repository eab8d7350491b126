use std::num::NonZeroU32;
use std::time::Duration;

use eventlog::{CommitRetryPolicy, ReadBatchSize};
use nutype::nutype;

/// Maximum number of database connections in the pool.
///
/// MaxConnections represents the connection pool size limit. It must be at least 1,
/// enforced by using NonZeroU32 as the underlying type.
///
/// # Examples
///
/// ```
/// use eventlog_postgres::MaxConnections;
/// use std::num::NonZeroU32;
///
/// let small_pool = MaxConnections::new(NonZeroU32::new(5).expect("5 is non-zero"));
/// assert_eq!(small_pool.to_string(), "5");
/// ```
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Unquoted PostgreSQL identifier used as a table name.
///
/// Lowercase ASCII letters, digits and underscores, starting with a letter
/// or underscore, at most 44 characters so that derived index names such
/// as `<table>_stream_version_key` stay within PostgreSQL's 63-byte
/// identifier limit.
#[nutype(
    validate(not_empty, len_char_max = 44, predicate = is_plain_identifier),
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
pub struct TableName(String);

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl TableName {
    /// The identifier, safe to splice into SQL unquoted.
    pub fn as_str(&self) -> &str {
        self
    }

    pub(crate) fn default_events() -> Self {
        Self::known("eventlog_events")
    }

    pub(crate) fn default_checkpoints() -> Self {
        Self::known("eventlog_checkpoints")
    }

    fn known(name: &str) -> Self {
        Self::try_new(name).unwrap_or_else(|_| unreachable!("{name} is a valid table name"))
    }
}

const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
    Some(v) => v,
    None => unreachable!(),
};

/// Configuration for PostgresEventStore.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Table holding the events (default: `eventlog_events`)
    pub event_table: TableName,
    /// Rows fetched per round trip while loading (default: 100)
    pub read_batch_size: ReadBatchSize,
    /// Backoff for commits that lost a version race (default: 5 ms, 8 retries)
    pub commit_retry: CommitRetryPolicy,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            event_table: TableName::default_events(),
            read_batch_size: ReadBatchSize::default(),
            commit_retry: CommitRetryPolicy::default(),
        }
    }
}

/// Configuration for PostgresCheckpointStorage.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Table holding one row per subscriber (default: `eventlog_checkpoints`)
    pub table: TableName,
}

impl Default for PostgresCheckpointConfig {
    fn default() -> Self {
        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            table: TableName::default_checkpoints(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(TableName::try_new("eventlog_events").is_ok());
        assert!(TableName::try_new("_events2").is_ok());
        assert!(TableName::try_new("Events").is_err());
        assert!(TableName::try_new("2events").is_err());
        assert!(TableName::try_new("events; DROP TABLE x").is_err());
        assert!(TableName::try_new("a".repeat(44)).is_ok());
        assert!(TableName::try_new("a".repeat(45)).is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PostgresConfig::default();

        assert_eq!(config.event_table.as_str(), "eventlog_events");
        assert_eq!(u32::from(NonZeroU32::from(config.max_connections)), 10);
        assert_eq!(config.read_batch_size.into_inner(), 100);
        assert_eq!(config.commit_retry, CommitRetryPolicy::default());
        assert_eq!(
            PostgresCheckpointConfig::default().table.as_str(),
            "eventlog_checkpoints"
        );
    }
}
