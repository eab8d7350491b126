//! Desired schema, live-schema introspection and the diff between them.
//!
//! `setup()` never drops or alters what already exists; it only creates
//! the table, adds missing columns and creates missing indexes. All steps
//! run in one transaction guarded by an advisory lock on the table name so
//! that concurrent setups of the same table apply each change once.

use std::collections::BTreeSet;

use eventlog::{SetupReport, StoreStatus};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use crate::config::TableName;
use crate::error::{correlation_id_index, id_index, stream_version_index};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnDefinition {
    name: &'static str,
    definition: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexDefinition {
    name: String,
    unique: bool,
    columns: &'static str,
}

/// Desired shape of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableDefinition {
    name: TableName,
    columns: Vec<ColumnDefinition>,
    indexes: Vec<IndexDefinition>,
}

const fn column(name: &'static str, definition: &'static str) -> ColumnDefinition {
    ColumnDefinition { name, definition }
}

impl TableDefinition {
    pub(crate) fn events(name: &TableName) -> Self {
        Self {
            columns: vec![
                column("sequence_number", "BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY"),
                column("stream", "VARCHAR(255) NOT NULL"),
                column("version", "BIGINT NOT NULL"),
                column("type", "VARCHAR(255) NOT NULL"),
                column("payload", "TEXT NOT NULL"),
                column("metadata", "TEXT NULL"),
                column("id", "VARCHAR(255) NOT NULL"),
                column("correlation_id", "VARCHAR(255) NULL"),
                column("causation_id", "VARCHAR(255) NULL"),
                column("recorded_at", "TIMESTAMPTZ NOT NULL"),
            ],
            indexes: vec![
                IndexDefinition {
                    name: id_index(name),
                    unique: true,
                    columns: "id",
                },
                IndexDefinition {
                    name: stream_version_index(name),
                    unique: true,
                    columns: "stream, version",
                },
                IndexDefinition {
                    name: correlation_id_index(name),
                    unique: false,
                    columns: "correlation_id",
                },
            ],
            name: name.clone(),
        }
    }

    pub(crate) fn checkpoints(name: &TableName) -> Self {
        Self {
            name: name.clone(),
            columns: vec![
                column("subscriber_id", "VARCHAR(255) PRIMARY KEY"),
                column("applied_sequence_number", "BIGINT NOT NULL DEFAULT 0"),
            ],
            indexes: Vec::new(),
        }
    }
}

/// What introspection found for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LiveTable {
    columns: BTreeSet<String>,
    indexes: BTreeSet<String>,
}

impl LiveTable {
    fn exists(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// One missing piece of the desired schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SchemaChange {
    CreateTable { table: TableName, ddl: String },
    AddColumn { table: TableName, column: &'static str, ddl: String },
    CreateIndex { table: TableName, index: String, ddl: String },
}

impl SchemaChange {
    fn ddl(&self) -> &str {
        match self {
            Self::CreateTable { ddl, .. }
            | Self::AddColumn { ddl, .. }
            | Self::CreateIndex { ddl, .. } => ddl,
        }
    }

    pub(crate) fn description(&self) -> String {
        match self {
            Self::CreateTable { table, .. } => format!("created table {table}"),
            Self::AddColumn { table, column, .. } => format!("added column {table}.{column}"),
            Self::CreateIndex { table, index, .. } => format!("created index {index} on {table}"),
        }
    }
}

pub(crate) fn diff(desired: &TableDefinition, live: &LiveTable) -> Vec<SchemaChange> {
    let table = &desired.name;
    let mut changes = Vec::new();

    if live.exists() {
        for col in &desired.columns {
            if !live.columns.contains(col.name) {
                changes.push(SchemaChange::AddColumn {
                    table: table.clone(),
                    column: col.name,
                    ddl: format!(
                        "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {}",
                        col.name, col.definition
                    ),
                });
            }
        }
    } else {
        let columns = desired
            .columns
            .iter()
            .map(|col| format!("{} {}", col.name, col.definition))
            .collect::<Vec<_>>()
            .join(", ");
        changes.push(SchemaChange::CreateTable {
            table: table.clone(),
            ddl: format!("CREATE TABLE IF NOT EXISTS {table} ({columns})"),
        });
    }

    for index in &desired.indexes {
        if !live.indexes.contains(&index.name) {
            let unique = if index.unique { "UNIQUE " } else { "" };
            changes.push(SchemaChange::CreateIndex {
                table: table.clone(),
                index: index.name.clone(),
                ddl: format!(
                    "CREATE {unique}INDEX IF NOT EXISTS {} ON {table} ({})",
                    index.name, index.columns
                ),
            });
        }
    }

    changes
}

async fn introspect(
    executor: &mut sqlx::PgConnection,
    table: &TableName,
) -> Result<LiveTable, sqlx::Error> {
    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1",
    )
    .bind(table.as_str())
    .fetch_all(&mut *executor)
    .await?;

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT indexname::text FROM pg_indexes \
         WHERE schemaname = current_schema() AND tablename = $1",
    )
    .bind(table.as_str())
    .fetch_all(&mut *executor)
    .await?;

    Ok(LiveTable {
        columns: columns.into_iter().collect(),
        indexes: indexes.into_iter().collect(),
    })
}

/// Pending changes without applying anything.
pub(crate) async fn pending_changes(
    pool: &PgPool,
    desired: &TableDefinition,
) -> Result<Vec<SchemaChange>, sqlx::Error> {
    let mut connection = pool.acquire().await?;
    let live = introspect(&mut connection, &desired.name).await?;
    Ok(diff(desired, &live))
}

/// Bring the table up to `desired` inside `tx`.
///
/// Takes a transaction-scoped advisory lock first; the caller commits.
#[instrument(name = "postgres.schema_setup", skip(tx, desired), fields(table = %desired.name))]
pub(crate) async fn apply(
    tx: &mut Transaction<'static, Postgres>,
    desired: &TableDefinition,
) -> Result<SetupReport, sqlx::Error> {
    let _ = sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(desired.name.as_str())
        .execute(&mut **tx)
        .await?;

    let live = introspect(tx, &desired.name).await?;
    let mut report = SetupReport::unchanged();
    for change in diff(desired, &live) {
        let _ = sqlx::query(change.ddl()).execute(&mut **tx).await?;
        info!("[postgres.schema_change] {}", change.description());
        report.record(change.description());
    }
    Ok(report)
}

pub(crate) fn status_from(
    table: &TableName,
    pending: Result<Vec<SchemaChange>, sqlx::Error>,
) -> StoreStatus {
    match pending {
        Ok(changes) if changes.is_empty() => StoreStatus::Ok {
            details: format!("table {table} is up to date"),
        },
        Ok(changes) => StoreStatus::SetupRequired {
            details: changes
                .iter()
                .map(SchemaChange::description)
                .collect::<Vec<_>>()
                .join("; ")
                .replace("created ", "missing ")
                .replace("added ", "missing "),
        },
        Err(error) => StoreStatus::Error {
            details: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_table() -> TableName {
        TableName::try_new("ledger").expect("valid table name")
    }

    fn live(columns: &[&str], indexes: &[&str]) -> LiveTable {
        LiveTable {
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            indexes: indexes.iter().map(|i| (*i).to_owned()).collect(),
        }
    }

    #[test]
    fn empty_database_needs_table_and_indexes() {
        let changes = diff(&TableDefinition::events(&events_table()), &LiveTable::default());

        let descriptions: Vec<String> = changes.iter().map(SchemaChange::description).collect();
        assert_eq!(
            descriptions,
            vec![
                "created table ledger",
                "created index ledger_id_key on ledger",
                "created index ledger_stream_version_key on ledger",
                "created index ledger_correlation_id_idx on ledger",
            ]
        );
        assert!(changes[0].ddl().starts_with(
            "CREATE TABLE IF NOT EXISTS ledger (sequence_number BIGINT GENERATED BY DEFAULT \
             AS IDENTITY PRIMARY KEY, stream VARCHAR(255) NOT NULL"
        ));
        assert_eq!(
            changes[2].ddl(),
            "CREATE UNIQUE INDEX IF NOT EXISTS ledger_stream_version_key \
             ON ledger (stream, version)"
        );
    }

    #[test]
    fn complete_schema_has_no_changes() {
        let desired = TableDefinition::events(&events_table());
        let current = live(
            &[
                "sequence_number",
                "stream",
                "version",
                "type",
                "payload",
                "metadata",
                "id",
                "correlation_id",
                "causation_id",
                "recorded_at",
            ],
            &[
                "ledger_pkey",
                "ledger_id_key",
                "ledger_stream_version_key",
                "ledger_correlation_id_idx",
            ],
        );

        assert!(diff(&desired, &current).is_empty());
    }

    #[test]
    fn legacy_table_gets_only_missing_columns_and_index() {
        let desired = TableDefinition::events(&events_table());
        let legacy = live(
            &[
                "sequence_number",
                "stream",
                "version",
                "type",
                "payload",
                "id",
                "recorded_at",
            ],
            &["ledger_pkey", "ledger_id_key", "ledger_stream_version_key"],
        );

        let ddl: Vec<String> = diff(&desired, &legacy)
            .iter()
            .map(|change| change.ddl().to_owned())
            .collect();

        assert_eq!(
            ddl,
            vec![
                "ALTER TABLE ledger ADD COLUMN IF NOT EXISTS metadata TEXT NULL",
                "ALTER TABLE ledger ADD COLUMN IF NOT EXISTS correlation_id VARCHAR(255) NULL",
                "ALTER TABLE ledger ADD COLUMN IF NOT EXISTS causation_id VARCHAR(255) NULL",
                "CREATE INDEX IF NOT EXISTS ledger_correlation_id_idx ON ledger (correlation_id)",
            ]
        );
    }

    #[test]
    fn status_lists_pending_changes() {
        let table = TableName::try_new("checkpoints").expect("valid table name");
        let pending = diff(&TableDefinition::checkpoints(&table), &LiveTable::default());

        let status = status_from(&table, Ok(pending));

        assert_eq!(
            status,
            StoreStatus::SetupRequired {
                details: "missing table checkpoints".to_owned()
            }
        );
        assert!(status_from(&table, Ok(Vec::new())).is_ok());
    }
}
