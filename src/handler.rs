use std::ops::Deref;

use async_trait::async_trait;

use crate::store::Envelope;
use crate::{Aggregate, Error};

/// This trait is used to implement an `EventHandler`. An event handler is intended to be an entity
/// which can create, update and delete a read side and perform side effects.
///
/// Handlers run after the events were appended: a failure is reported to the caller but never
/// undoes the append.
#[async_trait]
pub trait EventHandler<A>: Send + Sync
where
    A: Aggregate,
{
    /// Handle an event and perform an action. This action could be over a read model or a side-effect.
    async fn handle(&self, envelope: &Envelope<A>) -> Result<(), Error>;

    /// The name of the event handler. By default, this is the type name of the event handler,
    /// but it can be overridden to provide a custom name. This name is used as
    /// part of tracing spans, to identify the event handler being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
impl<A, Q, T> EventHandler<A> for T
where
    A: Aggregate,
    Q: EventHandler<A> + ?Sized,
    T: Deref<Target = Q> + Send + Sync,
{
    /// Deref call to [`EventHandler::handle`].
    async fn handle(&self, envelope: &Envelope<A>) -> Result<(), Error> {
        self.deref().handle(envelope).await
    }

    /// Deref call to [`EventHandler::name`].
    fn name(&self) -> &'static str {
        self.deref().name()
    }
}

/// The `ReplayableEventHandler` trait is used to add the `replay` behavior on an `EventHandler`.
///
/// Being replayable means that handling the same ordered history again converges to the same read
/// side. Such handlers must not call external APIs or rely on anything but the envelopes.
///
/// Read model projections are replayable, notifications are not.
pub trait ReplayableEventHandler<A>: EventHandler<A>
where
    A: Aggregate,
{
}

impl<A, Q, T> ReplayableEventHandler<A> for T
where
    A: Aggregate,
    Q: ReplayableEventHandler<A> + ?Sized,
    T: Deref<Target = Q> + Send + Sync,
{
}
