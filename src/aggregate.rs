use std::fmt::Debug;

use crate::event::DomainEvent;

/// The Aggregate trait is responsible for folding events into a state.
///
/// Business rules do not live here: they are enforced by the methods that validate a request and
/// then [`emit`](crate::AggregateRoot::emit) events. `apply_event` is re-run verbatim on every
/// replay, so it must be pure and total over every event that was ever legally emitted.
pub trait Aggregate: Send + Sync + 'static {
    /// The name of the aggregate type. It is written in every envelope and, for sql stores, used as
    /// table prefix.
    const NAME: &'static str;

    /// Internal aggregate state. The default value is the state before any event.
    type State: Default + Clone + PartialEq + Debug + Send + Sync;

    /// The events the aggregate emits and replays.
    type Event: DomainEvent;

    /// Updates the aggregate state using the new event.
    fn apply_event(state: Self::State, event: &Self::Event) -> Self::State;
}
