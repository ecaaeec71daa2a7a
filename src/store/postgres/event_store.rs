use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Transaction};
use uuid::Uuid;

use crate::event::{DomainEvent, EventEnvelope};
use crate::store::postgres::Statements;
use crate::store::{Envelope, EventStore};
use crate::types::{Metadata, Version, EMPTY_VERSION};
use crate::{Aggregate, Error};

/// Event representation on the event store
#[derive(sqlx::FromRow, Debug)]
pub struct DbEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: Version,
    pub payload: Value,
    pub occurred_on: DateTime<Utc>,
    pub metadata: Json<Metadata>,
}

impl DbEvent {
    pub fn try_into_envelope<E>(self) -> Result<EventEnvelope<E>, serde_json::Error>
    where
        E: DomainEvent,
    {
        Ok(EventEnvelope {
            id: self.id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            version: self.version,
            payload: serde_json::from_value::<E>(self.payload)?,
            occurred_on: self.occurred_on,
            metadata: self.metadata.0,
        })
    }
}

/// Postgres implementation of the [`EventStore`], persisting each aggregate type in its own
/// `<aggregate>_events` table.
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still having the same memory
/// reference.
pub struct PgEventStore<A>
where
    A: Aggregate,
{
    pub(super) inner: Arc<InnerPgEventStore>,
    pub(super) _aggregate: PhantomData<A>,
}

pub(super) struct InnerPgEventStore {
    pub(super) pool: Pool<Postgres>,
    pub(super) statements: Statements,
}

impl<A> PgEventStore<A>
where
    A: Aggregate,
{
    /// Returns the name of the event store table
    pub fn table_name(&self) -> &str {
        self.inner.statements.table_name()
    }

    async fn max_version(
        &self,
        aggregate_id: &str,
        executor: impl sqlx::Executor<'_, Database = Postgres>,
    ) -> Result<Version, Error> {
        let max: Option<Version> = sqlx::query_scalar(self.inner.statements.max_version())
            .bind(aggregate_id)
            .fetch_one(executor)
            .await?;

        Ok(max.unwrap_or(EMPTY_VERSION))
    }

    async fn conflict(&self, aggregate_id: &str, expected: Version) -> Error {
        let actual = match self.max_version(aggregate_id, &self.inner.pool).await {
            Ok(actual) => actual,
            Err(error) => return error,
        };

        Error::ConcurrencyConflict {
            aggregate_id: aggregate_id.to_string(),
            expected,
            actual,
        }
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}

#[async_trait]
impl<A> EventStore for PgEventStore<A>
where
    A: Aggregate,
{
    type Aggregate = A;

    async fn load(&self, aggregate_id: &str) -> Result<Vec<Envelope<A>>, Error> {
        sqlx::query_as::<_, DbEvent>(self.inner.statements.by_aggregate_id())
            .bind(aggregate_id)
            .fetch_all(&self.inner.pool)
            .await?
            .into_iter()
            .map(|event| Ok(event.try_into_envelope::<A::Event>()?))
            .collect()
    }

    #[tracing::instrument(skip_all, fields(table = self.table_name(), aggregate_id = %aggregate_id, expected_version = expected_version), err)]
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

        let mut transaction: Transaction<Postgres> = self.inner.pool.begin().await?;

        let _ = sqlx::query(self.inner.statements.lock_aggregate())
            .bind(aggregate_id)
            .execute(&mut *transaction)
            .await?;

        let actual_version = self.max_version(aggregate_id, &mut *transaction).await?;
        if actual_version != expected_version {
            return Err(Error::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual: actual_version,
            });
        }

        let occurred_on: DateTime<Utc> = Utc::now();
        let mut envelopes: Vec<Envelope<A>> = Vec::with_capacity(events.len());

        for (payload, version) in events.into_iter().zip(expected_version + 1..) {
            let id: Uuid = Uuid::new_v4();

            let inserted = sqlx::query(self.inner.statements.insert())
                .bind(id)
                .bind(aggregate_id)
                .bind(A::NAME)
                .bind(version)
                .bind(Json(&payload))
                .bind(occurred_on)
                .bind(Json(metadata))
                .execute(&mut *transaction)
                .await;

            match inserted {
                Ok(_) => {}
                Err(error) if is_unique_violation(&error) => {
                    drop(transaction);
                    return Err(self.conflict(aggregate_id, expected_version).await);
                }
                Err(error) => return Err(error.into()),
            }

            envelopes.push(EventEnvelope {
                id,
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: A::NAME.to_string(),
                version,
                payload,
                occurred_on,
                metadata: metadata.clone(),
            });
        }

        match transaction.commit().await {
            Ok(()) => Ok(envelopes),
            Err(error) if is_unique_violation(&error) => Err(self.conflict(aggregate_id, expected_version).await),
            Err(error) => Err(error.into()),
        }
    }

    async fn aggregate_ids(&self) -> Result<Vec<String>, Error> {
        Ok(sqlx::query_scalar(self.inner.statements.aggregate_ids())
            .fetch_all(&self.inner.pool)
            .await?)
    }
}

/// Debug implementation for [`PgEventStore`]. It just shows the statements, that are the only thing
/// that might be useful to debug.
impl<A> std::fmt::Debug for PgEventStore<A>
where
    A: Aggregate,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore")
            .field("statements", &self.inner.statements)
            .finish()
    }
}

impl<A> Clone for PgEventStore<A>
where
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _aggregate: PhantomData,
        }
    }
}
