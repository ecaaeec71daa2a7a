use std::sync::Arc;

use tracing::Instrument;

use crate::handler::EventHandler;
use crate::store::Envelope;
use crate::{Aggregate, Error};

type Handler<A> = Arc<dyn EventHandler<A>>;

/// Fans out freshly appended envelopes to the handlers subscribed to their event type.
///
/// Handlers are invoked one at a time, in registration order, for each envelope in append order.
pub struct DomainEventPublisher<A>
where
    A: Aggregate,
{
    subscriptions: Vec<(Option<&'static str>, Handler<A>)>,
}

impl<A> DomainEventPublisher<A>
where
    A: Aggregate,
{
    pub fn new() -> Self {
        Self { subscriptions: vec![] }
    }

    /// Subscribes a handler to a single event type, as returned by
    /// [`DomainEvent::event_type`](crate::DomainEvent::event_type).
    pub fn subscribe(mut self, event_type: &'static str, handler: impl EventHandler<A> + 'static) -> Self {
        self.subscriptions.push((Some(event_type), Arc::new(handler)));
        self
    }

    /// Subscribes a handler to every event of the aggregate.
    pub fn subscribe_all(mut self, handler: impl EventHandler<A> + 'static) -> Self {
        self.subscriptions.push((None, Arc::new(handler)));
        self
    }

    pub fn handlers_for<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a Handler<A>> + 'a {
        self.subscriptions
            .iter()
            .filter(move |(subscribed, _)| subscribed.map_or(true, |subscribed| subscribed == event_type))
            .map(|(_, handler)| handler)
    }

    /// Invokes every matching handler for every envelope, awaiting each before moving on.
    ///
    /// # Errors
    ///
    /// The first handler failure stops the fan-out and is returned as [`Error::Publish`]. The
    /// envelopes are already durable at this point: nothing is rolled back.
    #[tracing::instrument(skip_all, fields(aggregate = A::NAME, events = envelopes.len()))]
    pub async fn publish(&self, envelopes: &[Envelope<A>]) -> Result<(), Error> {
        for envelope in envelopes {
            for handler in self.handlers_for(envelope.event_type()) {
                let span = tracing::debug_span!(
                    "publisher.event_handler",
                    event_id = %envelope.id,
                    aggregate_id = %envelope.aggregate_id,
                    version = envelope.version,
                    event_handler = handler.name()
                );

                if let Err(error) = handler.handle(envelope).instrument(span).await {
                    tracing::error!(
                        event_id = %envelope.id,
                        aggregate_id = %envelope.aggregate_id,
                        version = envelope.version,
                        event_handler = handler.name(),
                        error = ?error,
                        "event handler failed to handle committed event"
                    );

                    return Err(Error::Publish {
                        event_id: envelope.id,
                        aggregate_id: envelope.aggregate_id.clone(),
                        version: envelope.version,
                        handler: handler.name(),
                        source: Box::new(error),
                    });
                }
            }
        }

        Ok(())
    }
}

impl<A> Default for DomainEventPublisher<A>
where
    A: Aggregate,
{
    fn default() -> Self {
        Self::new()
    }
}
