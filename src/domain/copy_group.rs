use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
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

/// Accepted range of a member's trade size multiplier, in basis points (1 bps to 1000x).
pub const MULTIPLIER_BPS_RANGE: std::ops::RangeInclusive<u32> = 1..=100_000;

/// A set of follower accounts copying the trades of a leader advisor.
pub struct CopyTradeGroup;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub account_id: String,
    pub multiplier_bps: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyGroupState {
    pub name: Option<String>,
    pub leader_advisor_id: String,
    /// In the order they first joined.
    pub members: Vec<GroupMember>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CopyGroupEvent {
    Created {
        copy_trade_group_id: String,
        group_id: String,
        name: String,
        leader_advisor_id: String,
    },
    MemberUpserted {
        copy_trade_group_id: String,
        member: GroupMember,
    },
    MemberRemoved {
        copy_trade_group_id: String,
        account_id: String,
    },
    Archived {
        copy_trade_group_id: String,
    },
}

impl DomainEvent for CopyGroupEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "CopyGroupCreated",
            Self::MemberUpserted { .. } => "CopyGroupMemberUpserted",
            Self::MemberRemoved { .. } => "CopyGroupMemberRemoved",
            Self::Archived { .. } => "CopyGroupArchived",
        }
    }

    fn aggregate_id(&self) -> &str {
        match self {
            Self::Created { copy_trade_group_id, .. }
            | Self::MemberUpserted { copy_trade_group_id, .. }
            | Self::MemberRemoved { copy_trade_group_id, .. }
            | Self::Archived { copy_trade_group_id } => copy_trade_group_id,
        }
    }
}

/// Inserts `member`, or replaces the one with the same account in place.
fn upsert_member(members: &mut Vec<GroupMember>, member: &GroupMember) {
    match members.iter_mut().find(|m| m.account_id == member.account_id) {
        Some(existing) => *existing = member.clone(),
        None => members.push(member.clone()),
    }
}

impl Aggregate for CopyTradeGroup {
    const NAME: &'static str = "copy_trade_group";
    type State = CopyGroupState;
    type Event = CopyGroupEvent;

    fn apply_event(mut state: Self::State, event: &Self::Event) -> Self::State {
        match event {
            CopyGroupEvent::Created {
                name, leader_advisor_id, ..
            } => {
                return CopyGroupState {
                    name: Some(name.clone()),
                    leader_advisor_id: leader_advisor_id.clone(),
                    ..CopyGroupState::default()
                }
            }
            CopyGroupEvent::MemberUpserted { member, .. } => upsert_member(&mut state.members, member),
            CopyGroupEvent::MemberRemoved { account_id, .. } => state.members.retain(|m| &m.account_id != account_id),
            CopyGroupEvent::Archived { .. } => state.archived = true,
        }
        state
    }
}

impl AggregateRoot<CopyTradeGroup> {
    pub fn create(&mut self, group_id: &str, name: &str, leader_advisor_id: &str) -> Result<(), Error> {
        let group_id = require_text("group_id", group_id)?;
        let name = require_text("name", name)?;
        let leader_advisor_id = require_text("leader_advisor_id", leader_advisor_id)?;

        if let Some(existing) = &self.state().name {
            return if *existing == name && self.state().leader_advisor_id == leader_advisor_id {
                Ok(())
            } else {
                Err(Error::validation(format!("copy group `{}` already exists", group_id)))
            };
        }

        self.emit(CopyGroupEvent::Created {
            copy_trade_group_id: bound_id(self)?,
            group_id,
            name,
            leader_advisor_id,
        })
    }

    pub fn upsert_member(&mut self, account_id: &str, multiplier_bps: u32, enabled: bool) -> Result<(), Error> {
        self.ensure_open()?;
        if !MULTIPLIER_BPS_RANGE.contains(&multiplier_bps) {
            return Err(Error::validation(format!(
                "multiplier of {} bps is outside {:?}",
                multiplier_bps, MULTIPLIER_BPS_RANGE
            )));
        }
        let member = GroupMember {
            account_id: require_text("account_id", account_id)?,
            multiplier_bps,
            enabled,
        };

        if self.state().members.contains(&member) {
            return Ok(());
        }

        self.emit(CopyGroupEvent::MemberUpserted {
            copy_trade_group_id: bound_id(self)?,
            member,
        })
    }

    /// Removing an account that is not a member changes nothing.
    pub fn remove_member(&mut self, account_id: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let account_id = account_id.trim();

        if !self.state().members.iter().any(|m| m.account_id == account_id) {
            return Ok(());
        }

        self.emit(CopyGroupEvent::MemberRemoved {
            copy_trade_group_id: bound_id(self)?,
            account_id: account_id.to_string(),
        })
    }

    pub fn archive(&mut self) -> Result<(), Error> {
        self.ensure_exists()?;

        if self.state().archived {
            return Ok(());
        }

        self.emit(CopyGroupEvent::Archived {
            copy_trade_group_id: bound_id(self)?,
        })
    }

    fn ensure_exists(&self) -> Result<(), Error> {
        match self.state().name {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("copy group `{}`", bound_id(self)?))),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        self.ensure_exists()?;
        if self.state().archived {
            return Err(Error::validation("an archived copy group cannot change"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCopyGroup {
    pub tenant_id: String,
    pub group_id: String,
    pub name: String,
    pub leader_advisor_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for CreateCopyGroup {
    type Output = CopyGroupView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertGroupMember {
    pub tenant_id: String,
    pub group_id: String,
    pub account_id: String,
    pub multiplier_bps: u32,
    pub enabled: bool,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for UpsertGroupMember {
    type Output = CopyGroupView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveGroupMember {
    pub tenant_id: String,
    pub group_id: String,
    pub account_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for RemoveGroupMember {
    type Output = CopyGroupView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveCopyGroup {
    pub tenant_id: String,
    pub group_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for ArchiveCopyGroup {
    type Output = CopyGroupView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCopyGroup {
    pub tenant_id: String,
    pub group_id: String,
}

impl Query for GetCopyGroup {
    type Output = Option<CopyGroupView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListCopyGroups {
    pub tenant_id: String,
    pub include_archived: bool,
}

impl Query for ListCopyGroups {
    type Output = Vec<CopyGroupView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyGroupView {
    pub tenant_id: String,
    pub group_id: String,
    pub name: String,
    pub leader_advisor_id: String,
    pub members: Vec<GroupMember>,
    pub archived: bool,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

pub struct CopyGroupProjection {
    read_models: Arc<dyn ReadModelStore<CopyGroupView>>,
}

impl CopyGroupProjection {
    pub fn new(read_models: Arc<dyn ReadModelStore<CopyGroupView>>) -> Self {
        Self { read_models }
    }
}

#[async_trait]
impl EventHandler<CopyTradeGroup> for CopyGroupProjection {
    async fn handle(&self, envelope: &Envelope<CopyTradeGroup>) -> Result<(), Error> {
        let (tenant_id, group_id) = read_model_key::<CopyTradeGroup>(envelope)?;

        let mut view = match &envelope.payload {
            CopyGroupEvent::Created {
                name, leader_advisor_id, ..
            } => CopyGroupView {
                tenant_id: tenant_id.to_string(),
                group_id: group_id.to_string(),
                name: name.clone(),
                leader_advisor_id: leader_advisor_id.clone(),
                members: vec![],
                archived: false,
                version: envelope.version,
                updated_at: envelope.occurred_on,
            },
            _ => self
                .read_models
                .get(tenant_id, group_id)
                .await?
                .ok_or_else(|| missing_read_model("copy group", tenant_id, group_id))?,
        };

        match &envelope.payload {
            CopyGroupEvent::Created { .. } => {}
            CopyGroupEvent::MemberUpserted { member, .. } => upsert_member(&mut view.members, member),
            CopyGroupEvent::MemberRemoved { account_id, .. } => view.members.retain(|m| &m.account_id != account_id),
            CopyGroupEvent::Archived { .. } => view.archived = true,
        }
        view.version = envelope.version;
        view.updated_at = envelope.occurred_on;

        self.read_models.upsert(tenant_id, group_id, view).await
    }
}

impl ReplayableEventHandler<CopyTradeGroup> for CopyGroupProjection {}

/// Handles the copy-trade group commands and queries.
pub struct CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup>,
{
    aggregates: Arc<AggregateStore<E>>,
    read_models: Arc<dyn ReadModelStore<CopyGroupView>>,
}

impl<E> CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    pub fn new(aggregates: Arc<AggregateStore<E>>, read_models: Arc<dyn ReadModelStore<CopyGroupView>>) -> Self {
        Self {
            aggregates,
            read_models,
        }
    }

    pub fn register(&self, commands: &mut CommandDispatcher, queries: &mut QueryDispatcher) -> Result<(), Error> {
        commands
            .register::<CreateCopyGroup>(self.clone())?
            .register::<UpsertGroupMember>(self.clone())?
            .register::<RemoveGroupMember>(self.clone())?
            .register::<ArchiveCopyGroup>(self.clone())?;
        queries
            .register::<GetCopyGroup>(self.clone())?
            .register::<ListCopyGroups>(self.clone())?;
        Ok(())
    }

    /// Applies `mutator` to the group and returns its refreshed view.
    async fn execute<F>(
        &self,
        tenant_id: &str,
        group_id: &str,
        metadata_for: (&str, DateTime<Utc>, &'static str),
        cancellation: &CancellationToken,
        mutator: F,
    ) -> Result<CopyGroupView, Error>
    where
        F: FnOnce(&mut AggregateRoot<CopyTradeGroup>) -> Result<(), Error> + Send,
    {
        let (requested_by, requested_at, command) = metadata_for;
        let group_id = require_text("group_id", group_id)?;
        let group_id = group_id.as_str();
        let id = aggregate_id::<CopyTradeGroup>(tenant_id, group_id);
        let metadata = command_metadata(tenant_id, group_id, requested_by, requested_at, command);

        self.aggregates.update(&id, metadata, cancellation, mutator).await?;

        self.read_models
            .get(tenant_id, group_id)
            .await?
            .ok_or_else(|| missing_read_model("copy group", tenant_id, group_id))
    }
}

impl<E> Clone for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup>,
{
    fn clone(&self) -> Self {
        Self {
            aggregates: Arc::clone(&self.aggregates),
            read_models: Arc::clone(&self.read_models),
        }
    }
}

#[async_trait]
impl<E> CommandHandler<CreateCopyGroup> for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    async fn handle(&self, command: CreateCopyGroup, cancellation: &CancellationToken) -> Result<CopyGroupView, Error> {
        self.execute(
            &command.tenant_id,
            &command.group_id,
            (&command.requested_by, command.requested_at, "CreateCopyGroup"),
            cancellation,
            |group| group.create(&command.group_id, &command.name, &command.leader_advisor_id),
        )
        .await
    }
}

#[async_trait]
impl<E> CommandHandler<UpsertGroupMember> for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    async fn handle(&self, command: UpsertGroupMember, cancellation: &CancellationToken) -> Result<CopyGroupView, Error> {
        self.execute(
            &command.tenant_id,
            &command.group_id,
            (&command.requested_by, command.requested_at, "UpsertGroupMember"),
            cancellation,
            |group| group.upsert_member(&command.account_id, command.multiplier_bps, command.enabled),
        )
        .await
    }
}

#[async_trait]
impl<E> CommandHandler<RemoveGroupMember> for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    async fn handle(&self, command: RemoveGroupMember, cancellation: &CancellationToken) -> Result<CopyGroupView, Error> {
        self.execute(
            &command.tenant_id,
            &command.group_id,
            (&command.requested_by, command.requested_at, "RemoveGroupMember"),
            cancellation,
            |group| group.remove_member(&command.account_id),
        )
        .await
    }
}

#[async_trait]
impl<E> CommandHandler<ArchiveCopyGroup> for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    async fn handle(&self, command: ArchiveCopyGroup, cancellation: &CancellationToken) -> Result<CopyGroupView, Error> {
        self.execute(
            &command.tenant_id,
            &command.group_id,
            (&command.requested_by, command.requested_at, "ArchiveCopyGroup"),
            cancellation,
            |group| group.archive(),
        )
        .await
    }
}

#[async_trait]
impl<E> QueryHandler<GetCopyGroup> for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    async fn handle(&self, query: GetCopyGroup, cancellation: &CancellationToken) -> Result<Option<CopyGroupView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.read_models.get(&query.tenant_id, query.group_id.trim()).await
    }
}

#[async_trait]
impl<E> QueryHandler<ListCopyGroups> for CopyGroupService<E>
where
    E: EventStore<Aggregate = CopyTradeGroup> + 'static,
{
    async fn handle(&self, query: ListCopyGroups, cancellation: &CancellationToken) -> Result<Vec<CopyGroupView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let groups = self.read_models.list(&query.tenant_id).await?;

        Ok(groups
            .into_iter()
            .filter(|group| query.include_archived || !group.archived)
            .collect())
    }
}
