use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Command, CommandDispatcher, CommandHandler, Query, QueryDispatcher, QueryHandler};
use crate::domain::{
    aggregate_id, bound_id, command_metadata, dedup_in_order, missing_read_model, read_model_key, require_text,
};
use crate::handler::{EventHandler, ReplayableEventHandler};
use crate::manager::AggregateStore;
use crate::read_model::ReadModelStore;
use crate::root::AggregateRoot;
use crate::store::{Envelope, EventStore};
use crate::types::Version;
use crate::{Aggregate, DomainEvent, Error};

/// An automated trading strategy published to the platform.
pub struct ExpertAdvisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvisorStatus {
    Active,
    Paused,
    /// Terminal: a retired advisor never changes again.
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorDetails {
    pub name: String,
    pub version_label: String,
    pub symbols: Vec<String>,
}

impl AdvisorDetails {
    /// Trims every field and upper-cases symbols, dropping duplicates.
    fn normalized(name: &str, version_label: &str, symbols: &[String]) -> Result<Self, Error> {
        let symbols = symbols
            .iter()
            .map(|symbol| require_text("symbol", symbol).map(|symbol| symbol.to_uppercase()))
            .collect::<Result<Vec<_>, _>>()?;
        if symbols.is_empty() {
            return Err(Error::validation("an advisor trades at least one symbol"));
        }

        Ok(Self {
            name: require_text("name", name)?,
            version_label: require_text("version_label", version_label)?,
            symbols: dedup_in_order(&symbols),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvisorState {
    pub details: Option<AdvisorDetails>,
    pub status: Option<AdvisorStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdvisorEvent {
    Registered {
        expert_advisor_id: String,
        advisor_id: String,
        details: AdvisorDetails,
    },
    DetailsUpdated {
        expert_advisor_id: String,
        details: AdvisorDetails,
    },
    StatusChanged {
        expert_advisor_id: String,
        from: AdvisorStatus,
        to: AdvisorStatus,
        reason: Option<String>,
    },
}

impl DomainEvent for AdvisorEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "AdvisorRegistered",
            Self::DetailsUpdated { .. } => "AdvisorDetailsUpdated",
            Self::StatusChanged { .. } => "AdvisorStatusChanged",
        }
    }

    fn aggregate_id(&self) -> &str {
        match self {
            Self::Registered { expert_advisor_id, .. }
            | Self::DetailsUpdated { expert_advisor_id, .. }
            | Self::StatusChanged { expert_advisor_id, .. } => expert_advisor_id,
        }
    }
}

impl Aggregate for ExpertAdvisor {
    const NAME: &'static str = "expert_advisor";
    type State = AdvisorState;
    type Event = AdvisorEvent;

    fn apply_event(state: Self::State, event: &Self::Event) -> Self::State {
        match event {
            AdvisorEvent::Registered { details, .. } => AdvisorState {
                details: Some(details.clone()),
                status: Some(AdvisorStatus::Active),
            },
            AdvisorEvent::DetailsUpdated { details, .. } => AdvisorState {
                details: Some(details.clone()),
                ..state
            },
            AdvisorEvent::StatusChanged { to, .. } => AdvisorState {
                status: Some(*to),
                ..state
            },
        }
    }
}

impl AggregateRoot<ExpertAdvisor> {
    pub fn register(&mut self, advisor_id: &str, name: &str, version_label: &str, symbols: &[String]) -> Result<(), Error> {
        let advisor_id = require_text("advisor_id", advisor_id)?;
        let details = AdvisorDetails::normalized(name, version_label, symbols)?;

        if let Some(existing) = &self.state().details {
            return if *existing == details {
                Ok(())
            } else {
                Err(Error::validation(format!("advisor `{}` is already registered", advisor_id)))
            };
        }

        self.emit(AdvisorEvent::Registered {
            expert_advisor_id: bound_id(self)?,
            advisor_id,
            details,
        })
    }

    /// Replaces the given fields, keeping the others.
    pub fn update_details(
        &mut self,
        name: Option<&str>,
        version_label: Option<&str>,
        symbols: Option<&[String]>,
    ) -> Result<(), Error> {
        let current = self.current_details()?;
        if self.state().status == Some(AdvisorStatus::Retired) {
            return Err(Error::validation("a retired advisor cannot be updated"));
        }

        let details = AdvisorDetails::normalized(
            name.unwrap_or(&current.name),
            version_label.unwrap_or(&current.version_label),
            symbols.unwrap_or(&current.symbols),
        )?;
        if details == current {
            return Ok(());
        }

        self.emit(AdvisorEvent::DetailsUpdated {
            expert_advisor_id: bound_id(self)?,
            details,
        })
    }

    pub fn change_status(&mut self, to: AdvisorStatus, reason: Option<String>) -> Result<(), Error> {
        self.current_details()?;

        let status = self.state().status;
        match status {
            Some(from) if from == to => Ok(()),
            Some(AdvisorStatus::Retired) => Err(Error::validation("a retired advisor cannot change status")),
            Some(from) => self.emit(AdvisorEvent::StatusChanged {
                expert_advisor_id: bound_id(self)?,
                from,
                to,
                reason,
            }),
            None => Err(Error::NotFound(format!("advisor `{}`", bound_id(self)?))),
        }
    }

    fn current_details(&self) -> Result<AdvisorDetails, Error> {
        match &self.state().details {
            Some(details) => Ok(details.clone()),
            None => Err(Error::NotFound(format!("advisor `{}`", bound_id(self)?))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAdvisor {
    pub tenant_id: String,
    pub advisor_id: String,
    pub name: String,
    pub version_label: String,
    pub symbols: Vec<String>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for RegisterAdvisor {
    type Output = AdvisorView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAdvisor {
    pub tenant_id: String,
    pub advisor_id: String,
    pub name: Option<String>,
    pub version_label: Option<String>,
    pub symbols: Option<Vec<String>>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for UpdateAdvisor {
    type Output = AdvisorView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAdvisorStatus {
    pub tenant_id: String,
    pub advisor_id: String,
    pub status: AdvisorStatus,
    pub reason: Option<String>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for ChangeAdvisorStatus {
    type Output = AdvisorView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAdvisor {
    pub tenant_id: String,
    pub advisor_id: String,
}

impl Query for GetAdvisor {
    type Output = Option<AdvisorView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListAdvisors {
    pub tenant_id: String,
    pub status: Option<AdvisorStatus>,
}

impl Query for ListAdvisors {
    type Output = Vec<AdvisorView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorView {
    pub tenant_id: String,
    pub advisor_id: String,
    pub name: String,
    pub version_label: String,
    pub symbols: Vec<String>,
    pub status: AdvisorStatus,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

pub struct AdvisorProjection {
    read_models: Arc<dyn ReadModelStore<AdvisorView>>,
}

impl AdvisorProjection {
    pub fn new(read_models: Arc<dyn ReadModelStore<AdvisorView>>) -> Self {
        Self { read_models }
    }
}

#[async_trait]
impl EventHandler<ExpertAdvisor> for AdvisorProjection {
    async fn handle(&self, envelope: &Envelope<ExpertAdvisor>) -> Result<(), Error> {
        let (tenant_id, advisor_id) = read_model_key::<ExpertAdvisor>(envelope)?;

        let mut view = match &envelope.payload {
            AdvisorEvent::Registered { details, .. } => AdvisorView {
                tenant_id: tenant_id.to_string(),
                advisor_id: advisor_id.to_string(),
                name: details.name.clone(),
                version_label: details.version_label.clone(),
                symbols: details.symbols.clone(),
                status: AdvisorStatus::Active,
                version: envelope.version,
                updated_at: envelope.occurred_on,
            },
            _ => self
                .read_models
                .get(tenant_id, advisor_id)
                .await?
                .ok_or_else(|| missing_read_model("advisor", tenant_id, advisor_id))?,
        };

        match &envelope.payload {
            AdvisorEvent::Registered { .. } => {}
            AdvisorEvent::DetailsUpdated { details, .. } => {
                view.name = details.name.clone();
                view.version_label = details.version_label.clone();
                view.symbols = details.symbols.clone();
            }
            AdvisorEvent::StatusChanged { to, .. } => view.status = *to,
        }
        view.version = envelope.version;
        view.updated_at = envelope.occurred_on;

        self.read_models.upsert(tenant_id, advisor_id, view).await
    }
}

impl ReplayableEventHandler<ExpertAdvisor> for AdvisorProjection {}

/// Handles the expert advisor commands and queries.
pub struct AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor>,
{
    aggregates: Arc<AggregateStore<E>>,
    read_models: Arc<dyn ReadModelStore<AdvisorView>>,
}

impl<E> AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor> + 'static,
{
    pub fn new(aggregates: Arc<AggregateStore<E>>, read_models: Arc<dyn ReadModelStore<AdvisorView>>) -> Self {
        Self {
            aggregates,
            read_models,
        }
    }

    pub fn register(&self, commands: &mut CommandDispatcher, queries: &mut QueryDispatcher) -> Result<(), Error> {
        commands
            .register::<RegisterAdvisor>(self.clone())?
            .register::<UpdateAdvisor>(self.clone())?
            .register::<ChangeAdvisorStatus>(self.clone())?;
        queries
            .register::<GetAdvisor>(self.clone())?
            .register::<ListAdvisors>(self.clone())?;
        Ok(())
    }

    async fn view(&self, tenant_id: &str, advisor_id: &str) -> Result<AdvisorView, Error> {
        self.read_models
            .get(tenant_id, advisor_id)
            .await?
            .ok_or_else(|| missing_read_model("advisor", tenant_id, advisor_id))
    }
}

impl<E> Clone for AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor>,
{
    fn clone(&self) -> Self {
        Self {
            aggregates: Arc::clone(&self.aggregates),
            read_models: Arc::clone(&self.read_models),
        }
    }
}

#[async_trait]
impl<E> CommandHandler<RegisterAdvisor> for AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor> + 'static,
{
    async fn handle(&self, command: RegisterAdvisor, cancellation: &CancellationToken) -> Result<AdvisorView, Error> {
        let advisor_id = require_text("advisor_id", &command.advisor_id)?;
        let id = aggregate_id::<ExpertAdvisor>(&command.tenant_id, &advisor_id);
        let metadata = command_metadata(
            &command.tenant_id,
            &advisor_id,
            &command.requested_by,
            command.requested_at,
            "RegisterAdvisor",
        );

        self.aggregates
            .update(&id, metadata, cancellation, |advisor| {
                advisor.register(
                    &advisor_id,
                    &command.name,
                    &command.version_label,
                    &command.symbols,
                )
            })
            .await?;

        self.view(&command.tenant_id, &advisor_id).await
    }
}

#[async_trait]
impl<E> CommandHandler<UpdateAdvisor> for AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor> + 'static,
{
    async fn handle(&self, command: UpdateAdvisor, cancellation: &CancellationToken) -> Result<AdvisorView, Error> {
        let advisor_id = require_text("advisor_id", &command.advisor_id)?;
        let id = aggregate_id::<ExpertAdvisor>(&command.tenant_id, &advisor_id);
        let metadata = command_metadata(
            &command.tenant_id,
            &advisor_id,
            &command.requested_by,
            command.requested_at,
            "UpdateAdvisor",
        );

        self.aggregates
            .update(&id, metadata, cancellation, |advisor| {
                advisor.update_details(
                    command.name.as_deref(),
                    command.version_label.as_deref(),
                    command.symbols.as_deref(),
                )
            })
            .await?;

        self.view(&command.tenant_id, &advisor_id).await
    }
}

#[async_trait]
impl<E> CommandHandler<ChangeAdvisorStatus> for AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor> + 'static,
{
    async fn handle(&self, command: ChangeAdvisorStatus, cancellation: &CancellationToken) -> Result<AdvisorView, Error> {
        let advisor_id = require_text("advisor_id", &command.advisor_id)?;
        let id = aggregate_id::<ExpertAdvisor>(&command.tenant_id, &advisor_id);
        let metadata = command_metadata(
            &command.tenant_id,
            &advisor_id,
            &command.requested_by,
            command.requested_at,
            "ChangeAdvisorStatus",
        );
        let reason = command.reason.clone();

        self.aggregates
            .update(&id, metadata, cancellation, |advisor| {
                advisor.change_status(command.status, reason)
            })
            .await?;

        self.view(&command.tenant_id, &advisor_id).await
    }
}

#[async_trait]
impl<E> QueryHandler<GetAdvisor> for AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor> + 'static,
{
    async fn handle(&self, query: GetAdvisor, cancellation: &CancellationToken) -> Result<Option<AdvisorView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.read_models.get(&query.tenant_id, query.advisor_id.trim()).await
    }
}

#[async_trait]
impl<E> QueryHandler<ListAdvisors> for AdvisorService<E>
where
    E: EventStore<Aggregate = ExpertAdvisor> + 'static,
{
    async fn handle(&self, query: ListAdvisors, cancellation: &CancellationToken) -> Result<Vec<AdvisorView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let advisors = self.read_models.list(&query.tenant_id).await?;

        Ok(match query.status {
            Some(status) => advisors.into_iter().filter(|advisor| advisor.status == status).collect(),
            None => advisors,
        })
    }
}
