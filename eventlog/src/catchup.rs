//! Checkpointed catch-up of a subscriber.
//!
//! A [`CatchUp`] run takes the subscriber's checkpoint lock, feeds every
//! selected event after the stored position to an [`EventHandler`] and
//! stores the new position when releasing the lock. Nothing is delivered
//! concurrently: the checkpoint lock is what keeps two instances of the same
//! subscriber from processing the same events.

use eventlog_types::{
    CheckpointError, CheckpointStorage, EventEnvelope, EventStore, EventStoreError,
    EventStreamFilter, LoadQuery, SequenceNumber, StreamSelector,
};
use futures::StreamExt;
use std::future::Future;
use std::num::NonZeroU64;
use tracing::{debug, info, instrument, warn};

/// Applies events during catch-up.
///
/// Events arrive one at a time in ascending sequence-number order. Returning
/// an error stops the run; the checkpoint keeps the position of the last
/// event that was handled successfully.
pub trait EventHandler: Send {
    /// Why the handler refused an event.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply one event.
    fn handle(
        &mut self,
        envelope: &EventEnvelope,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Why a catch-up run stopped early.
#[derive(Debug, thiserror::Error)]
pub enum CatchUpError<E: std::error::Error + 'static> {
    /// The checkpoint could not be locked or stored.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Loading events failed; progress so far was stored.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// The handler rejected an event; progress up to the previous event was
    /// stored.
    #[error("handler failed at sequence number {sequence_number}: {source}")]
    Handler {
        sequence_number: SequenceNumber,
        #[source]
        source: E,
    },
}

/// Result of a completed catch-up run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpProgress {
    /// Events handed to the handler during this run.
    pub events_applied: u64,
    /// Stored checkpoint after the run.
    pub position: SequenceNumber,
}

/// One catch-up pass over an event store for one subscriber.
pub struct CatchUp<'a, S, C> {
    store: &'a S,
    checkpoints: &'a C,
    selector: StreamSelector,
    filter: Option<EventStreamFilter>,
    batch_size: Option<NonZeroU64>,
}

impl<'a, S, C> CatchUp<'a, S, C>
where
    S: EventStore,
    C: CheckpointStorage,
{
    /// Catch up on every event in the log.
    pub fn new(store: &'a S, checkpoints: &'a C) -> Self {
        Self {
            store,
            checkpoints,
            selector: StreamSelector::all(),
            filter: None,
            batch_size: None,
        }
    }

    /// Only catch up on the events of `selector`.
    pub fn with_selector(mut self, selector: impl Into<StreamSelector>) -> Self {
        self.selector = selector.into();
        self
    }

    /// Only hand events of the filter's types to the handler.
    pub fn with_filter(mut self, filter: EventStreamFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Store progress and briefly release the lock every `batch_size` events.
    pub fn with_batch_size(mut self, batch_size: NonZeroU64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    fn query_after(&self, position: SequenceNumber) -> LoadQuery {
        let query =
            LoadQuery::new(self.selector.clone()).with_minimum_sequence_number(position.next());
        match &self.filter {
            Some(filter) => query.with_filter(filter.clone()),
            None => query,
        }
    }

    /// Run until the selected events are exhausted.
    #[instrument(
        name = "catch_up.run",
        skip(self, handler),
        fields(subscriber = %self.checkpoints.subscriber_id(), selector = %self.selector)
    )]
    pub async fn run<H: EventHandler>(
        &self,
        handler: &mut H,
    ) -> Result<CatchUpProgress, CatchUpError<H::Error>> {
        let mut position = self.checkpoints.acquire_lock().await?;
        debug!(%position, "[catch_up.locked] checkpoint lock acquired");

        let mut events = self.store.load_query(self.query_after(position));
        let mut events_applied = 0_u64;
        let mut since_release = 0_u64;

        while let Some(next) = events.next().await {
            let envelope = match next {
                Ok(envelope) => envelope,
                Err(error) => {
                    self.release(position).await?;
                    return Err(error.into());
                }
            };

            if let Err(source) = handler.handle(&envelope).await {
                warn!(
                    sequence_number = %envelope.sequence_number,
                    error = %source,
                    "[catch_up.handler_failed] storing progress before the failed event"
                );
                self.release(position).await?;
                return Err(CatchUpError::Handler {
                    sequence_number: envelope.sequence_number,
                    source,
                });
            }
            position = envelope.sequence_number;
            events_applied += 1;
            since_release += 1;

            if self
                .batch_size
                .is_some_and(|batch_size| since_release >= batch_size.get())
            {
                self.release(position).await?;
                let reacquired = self.checkpoints.acquire_lock().await?;
                since_release = 0;
                if reacquired != position {
                    debug!(
                        %position,
                        %reacquired,
                        "[catch_up.moved] checkpoint changed while unlocked, reloading"
                    );
                    position = reacquired;
                    events = self.store.load_query(self.query_after(position));
                }
            }
        }

        self.release(position).await?;
        info!(events_applied, %position, "[catch_up.done] caught up");
        Ok(CatchUpProgress {
            events_applied,
            position,
        })
    }

    async fn release(&self, position: SequenceNumber) -> Result<(), CheckpointError> {
        self.checkpoints.update_and_release_lock(position).await
    }
}
