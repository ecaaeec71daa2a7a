use std::sync::Arc;

use tracing::Instrument;

use crate::handler::ReplayableEventHandler;
use crate::store::{Envelope, EventStore};
use crate::{Aggregate, Error};

type AggregateOf<E> = <E as EventStore>::Aggregate;

/// Replays the event log through [`ReplayableEventHandler`]s, repairing read models that fell
/// behind because a publish step failed or was cancelled after its append committed.
///
/// Handlers must fully initialize their rows from the first event of a stream, so that replaying a
/// whole history converges to the same read side regardless of what was there before.
pub struct Rebuilder<E>
where
    E: EventStore,
{
    event_store: E,
    event_handlers: Vec<Arc<dyn ReplayableEventHandler<AggregateOf<E>>>>,
}

impl<E> Rebuilder<E>
where
    E: EventStore,
{
    pub fn new(event_store: E) -> Self {
        Self {
            event_store,
            event_handlers: vec![],
        }
    }

    pub fn add_event_handler(mut self, event_handler: impl ReplayableEventHandler<AggregateOf<E>> + 'static) -> Self {
        self.event_handlers.push(Arc::new(event_handler));
        self
    }

    /// Replays the history of a single aggregate. Returns the number of replayed envelopes.
    #[tracing::instrument(skip_all, fields(aggregate = <E::Aggregate as Aggregate>::NAME, aggregate_id = %aggregate_id), err)]
    pub async fn just_one_aggregate(&self, aggregate_id: &str) -> Result<usize, Error> {
        let envelopes: Vec<Envelope<AggregateOf<E>>> = self.event_store.load(aggregate_id).await?;

        for envelope in &envelopes {
            for event_handler in &self.event_handlers {
                let span = tracing::debug_span!(
                    "rebuilder.event_handler",
                    event_id = %envelope.id,
                    version = envelope.version,
                    event_handler = event_handler.name()
                );
                event_handler.handle(envelope).instrument(span).await?;
            }
        }

        Ok(envelopes.len())
    }

    /// Replays every aggregate, one after the other. Returns the number of replayed envelopes.
    #[tracing::instrument(skip_all, fields(aggregate = <E::Aggregate as Aggregate>::NAME), err)]
    pub async fn all_aggregates(&self) -> Result<usize, Error> {
        let mut replayed = 0;

        for aggregate_id in self.event_store.aggregate_ids().await? {
            replayed += self.just_one_aggregate(&aggregate_id).await?;
        }

        tracing::info!(replayed, "read models rebuilt");
        Ok(replayed)
    }
}
