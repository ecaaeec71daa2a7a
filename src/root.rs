use std::fmt::{Debug, Formatter};

use crate::event::{DomainEvent, EventEnvelope};
use crate::types::{Version, EMPTY_VERSION};
use crate::{Aggregate, Error};

/// A single aggregate instance: its identity, the state folded from its history and the events
/// emitted since it was loaded.
///
/// Instances are built fresh for every load or update and thrown away afterwards; only the event
/// history outlives them.
pub struct AggregateRoot<A>
where
    A: Aggregate,
{
    id: Option<String>,
    persisted_version: Version,
    state: A::State,
    uncommitted: Vec<A::Event>,
}

impl<A> AggregateRoot<A>
where
    A: Aggregate,
{
    /// Creates an unbound, empty aggregate. Its id is fixed by the first emitted event.
    pub fn new() -> Self {
        Self {
            id: None,
            persisted_version: EMPTY_VERSION,
            state: A::State::default(),
            uncommitted: vec![],
        }
    }

    /// Creates an empty aggregate bound to the given id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new()
        }
    }

    /// Rebuilds an aggregate by replaying its envelopes in version order.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IdentityMismatch`] if any envelope (or its payload) belongs to another
    /// aggregate, and with [`Error::VersionGap`] if versions are not `0, 1, 2, ...`. On failure the
    /// partially replayed instance is dropped.
    pub fn load_from_history(
        id: impl Into<String>,
        envelopes: impl IntoIterator<Item = EventEnvelope<A::Event>>,
    ) -> Result<Self, Error> {
        let mut aggregate = Self::with_id(id);

        for envelope in envelopes {
            aggregate.bind(&envelope.aggregate_id)?;
            aggregate.bind(envelope.payload.aggregate_id())?;

            let expected = aggregate.persisted_version + 1;
            if envelope.version != expected {
                return Err(Error::VersionGap {
                    aggregate_id: envelope.aggregate_id,
                    expected,
                    found: envelope.version,
                });
            }

            aggregate.state = A::apply_event(aggregate.state, &envelope.payload);
            aggregate.persisted_version = envelope.version;
        }

        Ok(aggregate)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> &A::State {
        &self.state
    }

    /// Version of the last durably appended event, [`EMPTY_VERSION`] if none.
    pub fn persisted_version(&self) -> Version {
        self.persisted_version
    }

    /// Version the aggregate will have once the uncommitted events are appended.
    pub fn current_version(&self) -> Version {
        self.persisted_version + self.uncommitted.len() as Version
    }

    /// True if no event was ever persisted nor emitted for this aggregate.
    pub fn is_new(&self) -> bool {
        self.current_version() == EMPTY_VERSION
    }

    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    /// Records a new event and immediately applies it, so callers observe the post-emit state.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IdentityMismatch`] if the event declares another aggregate id. The
    /// state is left untouched in that case.
    pub fn emit(&mut self, event: A::Event) -> Result<(), Error> {
        self.bind(event.aggregate_id())?;
        self.state = A::apply_event(std::mem::take(&mut self.state), &event);
        self.uncommitted.push(event);
        Ok(())
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.uncommitted)
    }

    pub(crate) fn mark_committed(&mut self, version: Version) {
        self.uncommitted.clear();
        self.persisted_version = version;
    }

    fn bind(&mut self, id: &str) -> Result<(), Error> {
        match &self.id {
            Some(bound) if bound != id => Err(Error::IdentityMismatch {
                expected: bound.clone(),
                found: id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.id = Some(id.to_string());
                Ok(())
            }
        }
    }
}

impl<A> Default for AggregateRoot<A>
where
    A: Aggregate,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Debug for AggregateRoot<A>
where
    A: Aggregate,
    A::Event: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("aggregate", &A::NAME)
            .field("id", &self.id)
            .field("persisted_version", &self.persisted_version)
            .field("state", &self.state)
            .field("uncommitted", &self.uncommitted)
            .finish()
    }
}
