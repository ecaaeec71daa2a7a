use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Command, CommandDispatcher, CommandHandler, Query, QueryDispatcher, QueryHandler};
use crate::domain::{aggregate_id, bound_id, command_metadata, missing_read_model, read_model_key, require_text};
use crate::handler::{EventHandler, ReplayableEventHandler};
use crate::manager::AggregateStore;
use crate::read_model::ReadModelStore;
use crate::root::AggregateRoot;
use crate::store::{Envelope, EventStore};
use crate::types::Version;
use crate::{Aggregate, DomainEvent, Error};

/// A notification received from an external system, e.g. a broker webhook.
pub struct IntegrationEvent;

/// Business key of an integration event: `<source>/<external_id>`, both trimmed.
///
/// `%` and `/` are percent-encoded in the source, so the first `/` always ends it and distinct
/// `(source, external_id)` pairs never share a key.
///
/// # Errors
///
/// Fails with [`Error::Validation`] if either part is blank.
pub fn integration_key(source: &str, external_id: &str) -> Result<String, Error> {
    let source = require_text("source", source)?;
    let external_id = require_text("external_id", external_id)?;

    Ok(format!("{}/{}", source.replace('%', "%25").replace('/', "%2F"), external_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationStatus {
    Pending,
    Acknowledged,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrationState {
    pub status: Option<IntegrationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IntegrationEventEvent {
    Recorded {
        integration_event_id: String,
        source: String,
        external_id: String,
        kind: String,
        payload: Value,
    },
    Acknowledged {
        integration_event_id: String,
        acknowledged_by: String,
    },
}

impl DomainEvent for IntegrationEventEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Recorded { .. } => "IntegrationEventRecorded",
            Self::Acknowledged { .. } => "IntegrationEventAcknowledged",
        }
    }

    fn aggregate_id(&self) -> &str {
        match self {
            Self::Recorded { integration_event_id, .. } | Self::Acknowledged { integration_event_id, .. } => {
                integration_event_id
            }
        }
    }
}

impl Aggregate for IntegrationEvent {
    const NAME: &'static str = "integration_event";
    type State = IntegrationState;
    type Event = IntegrationEventEvent;

    fn apply_event(_state: Self::State, event: &Self::Event) -> Self::State {
        match event {
            IntegrationEventEvent::Recorded { .. } => IntegrationState {
                status: Some(IntegrationStatus::Pending),
            },
            IntegrationEventEvent::Acknowledged { .. } => IntegrationState {
                status: Some(IntegrationStatus::Acknowledged),
            },
        }
    }
}

impl AggregateRoot<IntegrationEvent> {
    /// Recording an already known `(source, external_id)` is a no-op, whatever its payload.
    pub fn record(&mut self, source: &str, external_id: &str, kind: &str, payload: Value) -> Result<(), Error> {
        let source = require_text("source", source)?;
        let external_id = require_text("external_id", external_id)?;
        let kind = require_text("kind", kind)?;

        if self.state().status.is_some() {
            tracing::debug!(%source, %external_id, "integration event already recorded");
            return Ok(());
        }

        self.emit(IntegrationEventEvent::Recorded {
            integration_event_id: bound_id(self)?,
            source,
            external_id,
            kind,
            payload,
        })
    }

    pub fn acknowledge(&mut self, acknowledged_by: &str) -> Result<(), Error> {
        let status = self.state().status;
        match status {
            None => Err(Error::NotFound(format!("integration event `{}`", bound_id(self)?))),
            Some(IntegrationStatus::Acknowledged) => Ok(()),
            Some(IntegrationStatus::Pending) => {
                let acknowledged_by = require_text("acknowledged_by", acknowledged_by)?;
                self.emit(IntegrationEventEvent::Acknowledged {
                    integration_event_id: bound_id(self)?,
                    acknowledged_by,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIntegrationEvent {
    pub tenant_id: String,
    pub source: String,
    pub external_id: String,
    pub kind: String,
    pub payload: Value,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for RecordIntegrationEvent {
    type Output = IntegrationEventView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgeIntegrationEvent {
    pub tenant_id: String,
    pub source: String,
    pub external_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for AcknowledgeIntegrationEvent {
    type Output = IntegrationEventView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetIntegrationEvent {
    pub tenant_id: String,
    pub source: String,
    pub external_id: String,
}

impl Query for GetIntegrationEvent {
    type Output = Option<IntegrationEventView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListIntegrationEvents {
    pub tenant_id: String,
    pub source: Option<String>,
}

impl Query for ListIntegrationEvents {
    type Output = Vec<IntegrationEventView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEventView {
    pub tenant_id: String,
    pub source: String,
    pub external_id: String,
    pub kind: String,
    pub payload: Value,
    pub status: IntegrationStatus,
    pub acknowledged_by: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

pub struct IntegrationEventProjection {
    read_models: Arc<dyn ReadModelStore<IntegrationEventView>>,
}

impl IntegrationEventProjection {
    pub fn new(read_models: Arc<dyn ReadModelStore<IntegrationEventView>>) -> Self {
        Self { read_models }
    }
}

#[async_trait]
impl EventHandler<IntegrationEvent> for IntegrationEventProjection {
    async fn handle(&self, envelope: &Envelope<IntegrationEvent>) -> Result<(), Error> {
        let (tenant_id, key) = read_model_key::<IntegrationEvent>(envelope)?;

        let view = match &envelope.payload {
            IntegrationEventEvent::Recorded {
                source,
                external_id,
                kind,
                payload,
                ..
            } => IntegrationEventView {
                tenant_id: tenant_id.to_string(),
                source: source.clone(),
                external_id: external_id.clone(),
                kind: kind.clone(),
                payload: payload.clone(),
                status: IntegrationStatus::Pending,
                acknowledged_by: None,
                recorded_at: envelope.occurred_on,
                version: envelope.version,
                updated_at: envelope.occurred_on,
            },
            IntegrationEventEvent::Acknowledged { acknowledged_by, .. } => {
                let view = self
                    .read_models
                    .get(tenant_id, key)
                    .await?
                    .ok_or_else(|| missing_read_model("integration event", tenant_id, key))?;
                IntegrationEventView {
                    status: IntegrationStatus::Acknowledged,
                    acknowledged_by: Some(acknowledged_by.clone()),
                    version: envelope.version,
                    updated_at: envelope.occurred_on,
                    ..view
                }
            }
        };

        self.read_models.upsert(tenant_id, key, view).await
    }
}

impl ReplayableEventHandler<IntegrationEvent> for IntegrationEventProjection {}

/// Handles the integration event commands and queries.
pub struct IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent>,
{
    aggregates: Arc<AggregateStore<E>>,
    read_models: Arc<dyn ReadModelStore<IntegrationEventView>>,
}

impl<E> IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent> + 'static,
{
    pub fn new(
        aggregates: Arc<AggregateStore<E>>,
        read_models: Arc<dyn ReadModelStore<IntegrationEventView>>,
    ) -> Self {
        Self {
            aggregates,
            read_models,
        }
    }

    pub fn register(&self, commands: &mut CommandDispatcher, queries: &mut QueryDispatcher) -> Result<(), Error> {
        commands
            .register::<RecordIntegrationEvent>(self.clone())?
            .register::<AcknowledgeIntegrationEvent>(self.clone())?;
        queries
            .register::<GetIntegrationEvent>(self.clone())?
            .register::<ListIntegrationEvents>(self.clone())?;
        Ok(())
    }

    async fn view(&self, tenant_id: &str, key: &str) -> Result<IntegrationEventView, Error> {
        self.read_models
            .get(tenant_id, key)
            .await?
            .ok_or_else(|| missing_read_model("integration event", tenant_id, key))
    }
}

impl<E> Clone for IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent>,
{
    fn clone(&self) -> Self {
        Self {
            aggregates: Arc::clone(&self.aggregates),
            read_models: Arc::clone(&self.read_models),
        }
    }
}

#[async_trait]
impl<E> CommandHandler<RecordIntegrationEvent> for IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent> + 'static,
{
    async fn handle(
        &self,
        command: RecordIntegrationEvent,
        cancellation: &CancellationToken,
    ) -> Result<IntegrationEventView, Error> {
        let key = integration_key(&command.source, &command.external_id)?;
        let id = aggregate_id::<IntegrationEvent>(&command.tenant_id, &key);
        let metadata = command_metadata(
            &command.tenant_id,
            &key,
            &command.requested_by,
            command.requested_at,
            "RecordIntegrationEvent",
        );
        let payload = command.payload.clone();

        self.aggregates
            .update(&id, metadata, cancellation, |event| {
                event.record(&command.source, &command.external_id, &command.kind, payload)
            })
            .await?;

        self.view(&command.tenant_id, &key).await
    }
}

#[async_trait]
impl<E> CommandHandler<AcknowledgeIntegrationEvent> for IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent> + 'static,
{
    async fn handle(
        &self,
        command: AcknowledgeIntegrationEvent,
        cancellation: &CancellationToken,
    ) -> Result<IntegrationEventView, Error> {
        let key = integration_key(&command.source, &command.external_id)?;
        let id = aggregate_id::<IntegrationEvent>(&command.tenant_id, &key);
        let metadata = command_metadata(
            &command.tenant_id,
            &key,
            &command.requested_by,
            command.requested_at,
            "AcknowledgeIntegrationEvent",
        );

        self.aggregates
            .update(&id, metadata, cancellation, |event| event.acknowledge(&command.requested_by))
            .await?;

        self.view(&command.tenant_id, &key).await
    }
}

#[async_trait]
impl<E> QueryHandler<GetIntegrationEvent> for IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent> + 'static,
{
    async fn handle(
        &self,
        query: GetIntegrationEvent,
        cancellation: &CancellationToken,
    ) -> Result<Option<IntegrationEventView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let key = integration_key(&query.source, &query.external_id)?;
        self.read_models.get(&query.tenant_id, &key).await
    }
}

#[async_trait]
impl<E> QueryHandler<ListIntegrationEvents> for IntegrationEventService<E>
where
    E: EventStore<Aggregate = IntegrationEvent> + 'static,
{
    async fn handle(
        &self,
        query: ListIntegrationEvents,
        cancellation: &CancellationToken,
    ) -> Result<Vec<IntegrationEventView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let events = self.read_models.list(&query.tenant_id).await?;

        Ok(match &query.source {
            Some(source) => events.into_iter().filter(|event| &event.source == source).collect(),
            None => events,
        })
    }
}
