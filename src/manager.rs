use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::publisher::DomainEventPublisher;
use crate::root::AggregateRoot;
use crate::store::{Envelope, EventStore};
use crate::types::Metadata;
use crate::{Aggregate, Error};

type AggregateOf<E> = <E as EventStore>::Aggregate;

/// The AggregateStore is responsible for coupling aggregates with an [`EventStore`] and a
/// [`DomainEventPublisher`]: the state is reconstructed by loading and applying events sequentially,
/// and the events emitted by a mutator are appended and then published.
///
/// The basic APIs are:
/// 1. load
/// 2. update
///
/// Every update is one load, one optimistic concurrency check and one append, for exactly one
/// aggregate. Conflicts are returned as they are: retrying is up to the caller.
pub struct AggregateStore<E>
where
    E: EventStore,
{
    event_store: E,
    publisher: Arc<DomainEventPublisher<AggregateOf<E>>>,
}

impl<E> AggregateStore<E>
where
    E: EventStore,
{
    /// Creates a new instance of an [`AggregateStore`].
    pub fn new(event_store: E, publisher: DomainEventPublisher<AggregateOf<E>>) -> Self {
        Self {
            event_store,
            publisher: Arc::new(publisher),
        }
    }

    pub fn event_store(&self) -> &E {
        &self.event_store
    }

    /// Loads an aggregate instance from the event store, by applying previously persisted events onto
    /// a fresh aggregate by order of their version.
    ///
    /// An aggregate without history is returned empty: check [`AggregateRoot::is_new`].
    #[tracing::instrument(skip_all, fields(aggregate = <E::Aggregate as Aggregate>::NAME, aggregate_id = %aggregate_id), err)]
    pub async fn load(&self, aggregate_id: &str) -> Result<AggregateRoot<AggregateOf<E>>, Error> {
        let envelopes: Vec<Envelope<AggregateOf<E>>> = self.event_store.load(aggregate_id).await?;
        AggregateRoot::load_from_history(aggregate_id, envelopes)
    }

    /// Loads the aggregate, lets `mutator` emit events onto it, appends them at the loaded version and
    /// publishes the resulting envelopes. Returns the aggregate as committed.
    ///
    /// If the mutator emits nothing the store is not touched at all.
    ///
    /// Cancellation before the append aborts without effects. The append itself is never
    /// interrupted; cancellation after it only skips the remaining publishing, reported as
    /// [`Error::PublishCancelled`].
    ///
    /// # Errors
    ///
    /// Will return an `Err` if loading fails, if the mutator fails, on [`Error::ConcurrencyConflict`]
    /// and if a handler fails while publishing (in which case the events are already committed).
    #[tracing::instrument(skip_all, fields(aggregate = <E::Aggregate as Aggregate>::NAME, aggregate_id = %aggregate_id), err)]
    pub async fn update<F>(
        &self,
        aggregate_id: &str,
        metadata: Metadata,
        cancellation: &CancellationToken,
        mutator: F,
    ) -> Result<AggregateRoot<AggregateOf<E>>, Error>
    where
        F: FnOnce(&mut AggregateRoot<AggregateOf<E>>) -> Result<(), Error> + Send,
    {
        let mut aggregate = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(Error::Cancelled),
            loaded = self.load(aggregate_id) => loaded?,
        };

        mutator(&mut aggregate)?;

        if aggregate.uncommitted_events().is_empty() {
            tracing::debug!("no events emitted, skipping append");
            return Ok(aggregate);
        }

        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let expected_version = aggregate.persisted_version();
        let events = aggregate.take_uncommitted();

        let envelopes = self
            .event_store
            .append(aggregate_id, expected_version, events, &metadata)
            .await?;

        if let Some(last) = envelopes.last() {
            aggregate.mark_committed(last.version);
        }

        tracing::debug!(
            from_version = expected_version + 1,
            to_version = aggregate.persisted_version(),
            "events appended"
        );

        tokio::select! {
            biased;
            published = self.publisher.publish(&envelopes) => published?,
            _ = cancellation.cancelled() => {
                tracing::warn!(committed_version = aggregate.persisted_version(), "publishing cancelled after append");
                return Err(Error::PublishCancelled {
                    aggregate_id: aggregate_id.to_string(),
                    committed_version: aggregate.persisted_version(),
                });
            }
        }

        Ok(aggregate)
    }
}

impl<E> Clone for AggregateStore<E>
where
    E: EventStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            event_store: self.event_store.clone(),
            publisher: Arc::clone(&self.publisher),
        }
    }
}
