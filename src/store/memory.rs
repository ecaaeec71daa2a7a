use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event::{DomainEvent, EventEnvelope};
use crate::store::{Envelope, EventStore};
use crate::types::{Metadata, Version, EMPTY_VERSION};
use crate::{Aggregate, Error};

/// In-process [`EventStore`], keeping one ordered stream per aggregate id.
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still having the same memory
/// reference. Every append is checked and written under a single write lock, so a batch is either
/// fully visible or not at all.
pub struct InMemoryEventStore<A>
where
    A: Aggregate,
{
    streams: Arc<RwLock<HashMap<String, Vec<Envelope<A>>>>>,
}

impl<A> InMemoryEventStore<A>
where
    A: Aggregate,
{
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of envelopes stored for the given aggregate.
    pub async fn stream_len(&self, aggregate_id: &str) -> usize {
        self.streams
            .read()
            .await
            .get(aggregate_id)
            .map_or(0, Vec::len)
    }
}

impl<A> Default for InMemoryEventStore<A>
where
    A: Aggregate,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for InMemoryEventStore<A>
where
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            streams: Arc::clone(&self.streams),
        }
    }
}

#[async_trait]
impl<A> EventStore for InMemoryEventStore<A>
where
    A: Aggregate,
{
    type Aggregate = A;

    async fn load(&self, aggregate_id: &str) -> Result<Vec<Envelope<A>>, Error> {
        Ok(self
            .streams
            .read()
            .await
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: Version,
        events: Vec<A::Event>,
        metadata: &Metadata,
    ) -> Result<Vec<Envelope<A>>, Error> {
        if let Some(event) = events.iter().find(|event| event.aggregate_id() != aggregate_id) {
            return Err(Error::IdentityMismatch {
                expected: aggregate_id.to_string(),
                found: event.aggregate_id().to_string(),
            });
        }

        let mut streams = self.streams.write().await;

        let actual_version: Version = streams
            .get(aggregate_id)
            .and_then(|stream| stream.last())
            .map_or(EMPTY_VERSION, EventEnvelope::version);

        if actual_version != expected_version {
            return Err(Error::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual: actual_version,
            });
        }

        if events.is_empty() {
            return Ok(vec![]);
        }

        let occurred_on: DateTime<Utc> = Utc::now();
        let envelopes: Vec<Envelope<A>> = events
            .into_iter()
            .zip(expected_version + 1..)
            .map(|(payload, version)| EventEnvelope {
                id: Uuid::new_v4(),
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: A::NAME.to_string(),
                version,
                payload,
                occurred_on,
                metadata: metadata.clone(),
            })
            .collect();

        streams
            .entry(aggregate_id.to_string())
            .or_default()
            .extend(envelopes.iter().cloned());

        Ok(envelopes)
    }

    async fn aggregate_ids(&self) -> Result<Vec<String>, Error> {
        let mut ids: Vec<String> = self.streams.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
