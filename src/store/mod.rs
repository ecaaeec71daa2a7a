use std::ops::Deref;

use async_trait::async_trait;

use crate::event::EventEnvelope;
use crate::types::{Metadata, Version};
use crate::{Aggregate, Error};

pub use memory::InMemoryEventStore;

mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Shorthand for the envelope type of an aggregate's events.
pub type Envelope<A> = EventEnvelope<<A as Aggregate>::Event>;

/// An EventStore is responsible for appending the events that an aggregate emits, and loading the
/// events that represent an aggregate's history.
///
/// The store never publishes anything: notifying handlers is the job of the caller once an append
/// succeeded.
#[async_trait]
pub trait EventStore: Send + Sync {
    type Aggregate: Aggregate;

    /// Loads the envelopes of an aggregate instance ordered by version. An empty list means the
    /// aggregate does not exist yet.
    async fn load(&self, aggregate_id: &str) -> Result<Vec<Envelope<Self::Aggregate>>, Error>;

    /// Appends a batch of events after `expected_version`, assigning them the consecutive versions
    /// `expected_version + 1 ..= expected_version + events.len()`.
    ///
    /// Either the whole batch becomes visible to subsequent loads or none of it does.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ConcurrencyConflict`] if the highest stored version is not
    /// `expected_version`, and with [`Error::IdentityMismatch`] if an event declares another
    /// aggregate id.
    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: Version,
        events: Vec<<Self::Aggregate as Aggregate>::Event>,
        metadata: &Metadata,
    ) -> Result<Vec<Envelope<Self::Aggregate>>, Error>;

    /// Lists the ids of every aggregate with at least one event.
    async fn aggregate_ids(&self) -> Result<Vec<String>, Error>;
}

/// Blanket implementation making an [`EventStore`] every (smart) pointer to an [`EventStore`],
/// e.g. `&Store`, `Box<Store>`, `Arc<dyn EventStore<Aggregate = A>>`.
#[async_trait]
impl<S, T> EventStore for T
where
    S: EventStore + ?Sized,
    T: Deref<Target = S> + Send + Sync,
{
    type Aggregate = S::Aggregate;

    /// Deref call to [`EventStore::load`].
    async fn load(&self, aggregate_id: &str) -> Result<Vec<Envelope<Self::Aggregate>>, Error> {
        self.deref().load(aggregate_id).await
    }

    /// Deref call to [`EventStore::append`].
    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: Version,
        events: Vec<<Self::Aggregate as Aggregate>::Event>,
        metadata: &Metadata,
    ) -> Result<Vec<Envelope<Self::Aggregate>>, Error> {
        self.deref()
            .append(aggregate_id, expected_version, events, metadata)
            .await
    }

    /// Deref call to [`EventStore::aggregate_ids`].
    async fn aggregate_ids(&self) -> Result<Vec<String>, Error> {
        self.deref().aggregate_ids().await
    }
}
