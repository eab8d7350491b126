use chrono::{DateTime, Utc};
use eventlog::{
    Event, EventData, EventEnvelope, EventId, EventMetadata, EventStoreError, EventType,
    LoadQuery, Operation, PageSource, SequenceNumber, StreamName, StreamSelector, Version,
    VirtualStreamName,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::config::TableName;
use crate::error::map_sqlx_error;

const COLUMNS: &str =
    "sequence_number, stream, version, type, payload, metadata, id, recorded_at";

/// Escape `%`, `_` and the escape character itself so that a category
/// prefix only matches literally in `LIKE ... ESCAPE '\'`.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn to_bigint(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value)
        .map_err(|_| {
            EventStoreError::store_failure(Operation::Load, format!("{value} exceeds BIGINT"))
        })
}

pub(crate) fn page_query<'args>(
    table: &TableName,
    query: &'args LoadQuery,
    page_size: u64,
) -> Result<QueryBuilder<'args, Postgres>, EventStoreError> {
    let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {table} WHERE TRUE"));

    match query.selector() {
        StreamSelector::Stream(stream_name) => {
            let _ = builder.push(" AND stream = ").push_bind(stream_name.as_str());
        }
        StreamSelector::Virtual(VirtualStreamName::All) => {}
        StreamSelector::Virtual(VirtualStreamName::Category(category)) => {
            let _ = builder
                .push(" AND stream LIKE ")
                .push_bind(like_prefix(category.as_str()))
                .push(" ESCAPE '\\'");
        }
        StreamSelector::Virtual(VirtualStreamName::CorrelationId(correlation_id)) => {
            let _ = builder
                .push(" AND correlation_id = ")
                .push_bind(correlation_id.to_string());
        }
    }

    if let Some(filter) = query.filter() {
        let event_types: Vec<String> = filter.event_types().map(ToString::to_string).collect();
        if event_types.is_empty() {
            let _ = builder.push(" AND FALSE");
        } else {
            let _ = builder.push(" AND type = ANY(").push_bind(event_types).push(")");
        }
    }

    if let Some(minimum) = query.minimum_sequence_number() {
        let _ = builder
            .push(" AND sequence_number >= ")
            .push_bind(to_bigint(minimum.into_inner())?);
    }
    if let Some(maximum) = query.maximum_sequence_number() {
        let _ = builder
            .push(" AND sequence_number <= ")
            .push_bind(to_bigint(maximum.into_inner())?);
    }

    let direction = if query.is_backwards() { "DESC" } else { "ASC" };
    let _ = builder
        .push(format!(" ORDER BY sequence_number {direction} LIMIT "))
        .push_bind(to_bigint(page_size)?);
    Ok(builder)
}

fn decoding_failed(sequence_number: SequenceNumber, detail: impl ToString) -> EventStoreError {
    EventStoreError::DecodingFailed {
        sequence_number,
        detail: detail.to_string(),
    }
}

fn decode_row(row: &PgRow) -> Result<EventEnvelope, EventStoreError> {
    let raw_sequence_number: i64 = row
        .try_get("sequence_number")
        .map_err(|error| EventStoreError::store_failure(Operation::Load, error))?;
    let sequence_number = u64::try_from(raw_sequence_number)
        .map(SequenceNumber::new)
        .map_err(|_| {
            EventStoreError::store_failure(
                Operation::Load,
                format!("stored sequence number {raw_sequence_number} is negative"),
            )
        })?;
    let failed = |detail: &dyn std::fmt::Display| decoding_failed(sequence_number, detail);

    let stream: String = row.try_get("stream").map_err(|e| failed(&e))?;
    let version: i64 = row.try_get("version").map_err(|e| failed(&e))?;
    let event_type: String = row.try_get("type").map_err(|e| failed(&e))?;
    let payload: String = row.try_get("payload").map_err(|e| failed(&e))?;
    let metadata: Option<String> = row.try_get("metadata").map_err(|e| failed(&e))?;
    let id: String = row.try_get("id").map_err(|e| failed(&e))?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(|e| failed(&e))?;

    let metadata = match metadata.as_deref() {
        None | Some("") => EventMetadata::new(),
        Some(encoded) => serde_json::from_str(encoded).map_err(|e| failed(&e))?,
    };
    let event = Event::new(
        EventType::try_new(event_type).map_err(|e| failed(&e))?,
        EventData::new(payload),
    )
    .with_id(EventId::try_new(id).map_err(|e| failed(&e))?)
    .with_metadata(metadata);

    Ok(EventEnvelope {
        event,
        stream_name: StreamName::try_new(stream).map_err(|e| failed(&e))?,
        version: Version::new(u64::try_from(version).map_err(|e| failed(&e))?),
        sequence_number,
        recorded_at,
    })
}

/// Fetches pages of the events table for [`eventlog::paginate`].
#[derive(Debug, Clone)]
pub(crate) struct PostgresPages {
    pub(crate) pool: PgPool,
    pub(crate) table: TableName,
}

impl PageSource for PostgresPages {
    async fn fetch_page(
        &self,
        query: &LoadQuery,
        page_size: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let rows = page_query(&self.table, query, page_size)?
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, &self.table, Operation::Load))?;

        rows.iter().map(decode_row).collect()
    }
}
