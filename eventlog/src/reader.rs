//! Page-driven lazy reads.
//!
//! Backends fetch one bounded page at a time through [`PageSource`];
//! [`paginate`] turns that into an [`EventStream`] that narrows the query's
//! sequence-number window after every page, so no cursor or transaction is
//! held between pages.

use eventlog_types::{EventEnvelope, EventStoreError, EventStream, LoadQuery};
use futures::{stream, StreamExt, TryStreamExt};
use nutype::nutype;
use std::future::Future;
use tracing::debug;

/// Number of rows fetched per round trip while reading.
#[nutype(
    validate(greater = 0),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ReadBatchSize(u64);

/// Something that can return one page of a [`LoadQuery`].
pub trait PageSource: Send + Sync + 'static {
    /// Return at most `page_size` events matching `query`, ordered by
    /// sequence number in the query's direction.
    ///
    /// Implementations ignore [`LoadQuery::limit`]; the pager enforces it.
    fn fetch_page(
        &self,
        query: &LoadQuery,
        page_size: u64,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send;
}

struct Pager<S> {
    source: S,
    query: LoadQuery,
    page_size: u64,
    remaining: Option<u64>,
    exhausted: bool,
}

impl<S: PageSource> Pager<S> {
    async fn next_page(mut self) -> Result<Option<(Vec<EventEnvelope>, Self)>, EventStoreError> {
        if self.exhausted || self.remaining == Some(0) {
            return Ok(None);
        }

        let wanted = self
            .remaining
            .map_or(self.page_size, |remaining| remaining.min(self.page_size));
        let page = self.source.fetch_page(&self.query, wanted).await?;
        let Some(last) = page.last() else {
            return Ok(None);
        };

        let fetched = u64::try_from(page.len()).unwrap_or(u64::MAX);
        debug!(fetched, wanted, "[reader.page] fetched page");
        if fetched < wanted {
            self.exhausted = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(fetched);
        }

        let position = last.sequence_number;
        self.query = if self.query.is_backwards() {
            self.query.with_maximum_sequence_number(position.previous())
        } else {
            self.query.with_minimum_sequence_number(position.next())
        };

        Ok(Some((page, self)))
    }
}

/// Turn a page source into a lazy event stream.
///
/// Nothing is fetched before the stream is polled. Dropping the stream
/// early abandons the read without side effects.
pub fn paginate<S: PageSource>(
    source: S,
    query: LoadQuery,
    batch_size: ReadBatchSize,
) -> EventStream {
    let pager = Pager {
        source,
        remaining: query.limit().map(u64::from),
        query,
        page_size: batch_size.into_inner(),
        exhausted: false,
    };

    stream::try_unfold(pager, Pager::next_page)
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
        .try_flatten()
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eventlog_types::{
        Event, EventType, Operation, SequenceNumber, StreamName, StreamSelector, Version,
    };
    use std::num::NonZeroU64;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-process log of `len` events, counting page fetches.
    #[derive(Clone)]
    struct VecSource {
        events: Arc<Vec<EventEnvelope>>,
        fetches: Arc<AtomicUsize>,
        fail_on_fetch: Option<usize>,
    }

    impl VecSource {
        fn with_events(len: u64) -> Self {
            let event_type = EventType::try_new("Test:Happened").expect("valid event type");
            let stream_name = StreamName::try_new("orders:1").expect("valid stream name");
            let events = (1..=len)
                .map(|n| EventEnvelope {
                    event: Event::new(event_type.clone(), n.to_string()),
                    stream_name: stream_name.clone(),
                    version: Version::new(n - 1),
                    sequence_number: SequenceNumber::new(n),
                    recorded_at: Utc::now(),
                })
                .collect();
            Self {
                events: Arc::new(events),
                fetches: Arc::new(AtomicUsize::new(0)),
                fail_on_fetch: None,
            }
        }
    }

    impl PageSource for VecSource {
        async fn fetch_page(
            &self,
            query: &LoadQuery,
            page_size: u64,
        ) -> Result<Vec<EventEnvelope>, EventStoreError> {
            let fetch = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_fetch == Some(fetch) {
                return Err(EventStoreError::store_failure(Operation::Load, "boom"));
            }
            let take = usize::try_from(page_size).expect("page size fits usize");
            let matching = self.events.iter().filter(|event| query.matches(event));
            let page = if query.is_backwards() {
                matching.rev().take(take).cloned().collect()
            } else {
                matching.take(take).cloned().collect()
            };
            Ok(page)
        }
    }

    fn positions(events: &[EventEnvelope]) -> Vec<u64> {
        events
            .iter()
            .map(|event| event.sequence_number.into_inner())
            .collect()
    }

    fn everything() -> LoadQuery {
        LoadQuery::new(StreamSelector::all())
    }

    fn batch_size(size: u64) -> ReadBatchSize {
        ReadBatchSize::try_new(size).expect("valid batch size")
    }

    #[tokio::test]
    async fn reads_every_event_across_pages_in_order() {
        let source = VecSource::with_events(7);

        let events: Vec<_> = paginate(source.clone(), everything(), batch_size(3))
            .try_collect()
            .await
            .expect("read succeeds");

        assert_eq!(positions(&events), (1..=7).collect::<Vec<_>>());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_needs_one_empty_fetch() {
        let source = VecSource::with_events(6);

        let events: Vec<_> = paginate(source.clone(), everything(), batch_size(3))
            .try_collect()
            .await
            .expect("read succeeds");

        assert_eq!(events.len(), 6);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backwards_reads_descend() {
        let query = LoadQuery::new(StreamSelector::all()).backwards();

        let events: Vec<_> = paginate(VecSource::with_events(5), query, batch_size(2))
            .try_collect()
            .await
            .expect("read succeeds");

        assert_eq!(positions(&events), vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn limit_caps_total_events_across_pages() {
        let query = LoadQuery::new(StreamSelector::all())
            .with_minimum_sequence_number(SequenceNumber::new(2))
            .with_limit(NonZeroU64::new(4).expect("non-zero"));

        let events: Vec<_> = paginate(VecSource::with_events(20), query, batch_size(3))
            .try_collect()
            .await
            .expect("read succeeds");

        assert_eq!(positions(&events), vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn nothing_is_fetched_until_polled() {
        let source = VecSource::with_events(3);

        let stream = paginate(source.clone(), everything(), batch_size(2));
        drop(stream);

        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abandoning_a_read_stops_fetching() {
        let source = VecSource::with_events(10);

        let first: Vec<_> = paginate(source.clone(), everything(), batch_size(2))
            .take(1)
            .try_collect()
            .await
            .expect("read succeeds");

        assert_eq!(positions(&first), vec![1]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_failure_surfaces_after_earlier_pages() {
        let mut source = VecSource::with_events(10);
        source.fail_on_fetch = Some(1);

        let results: Vec<_> = paginate(source, everything(), batch_size(2)).collect().await;

        assert_eq!(results.len(), 3);
        assert!(results[..2].iter().all(Result::is_ok));
        assert!(results[2].is_err());
    }

    #[test]
    fn batch_size_defaults_to_100_and_rejects_zero() {
        assert_eq!(ReadBatchSize::default().into_inner(), 100);
        assert!(ReadBatchSize::try_new(0).is_err());
    }
}
