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

/// An operator of the administrative backend and the roles granting them access.
pub struct AdminUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminUserStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminUserState {
    pub email: String,
    pub roles: Vec<Role>,
    /// `None` until the user is provisioned.
    pub status: Option<AdminUserStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdminUserEvent {
    Provisioned {
        admin_user_id: String,
        user_id: String,
        email: String,
        roles: Vec<Role>,
    },
    RolesUpdated {
        admin_user_id: String,
        roles: Vec<Role>,
    },
    Disabled {
        admin_user_id: String,
        reason: Option<String>,
    },
}

impl DomainEvent for AdminUserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Provisioned { .. } => "AdminUserProvisioned",
            Self::RolesUpdated { .. } => "AdminUserRolesUpdated",
            Self::Disabled { .. } => "AdminUserDisabled",
        }
    }

    fn aggregate_id(&self) -> &str {
        match self {
            Self::Provisioned { admin_user_id, .. }
            | Self::RolesUpdated { admin_user_id, .. }
            | Self::Disabled { admin_user_id, .. } => admin_user_id,
        }
    }
}

impl Aggregate for AdminUser {
    const NAME: &'static str = "admin_user";
    type State = AdminUserState;
    type Event = AdminUserEvent;

    fn apply_event(state: Self::State, event: &Self::Event) -> Self::State {
        match event {
            AdminUserEvent::Provisioned { email, roles, .. } => AdminUserState {
                email: email.clone(),
                roles: roles.clone(),
                status: Some(AdminUserStatus::Active),
            },
            AdminUserEvent::RolesUpdated { roles, .. } => AdminUserState {
                roles: roles.clone(),
                ..state
            },
            AdminUserEvent::Disabled { .. } => AdminUserState {
                status: Some(AdminUserStatus::Disabled),
                ..state
            },
        }
    }
}

/// Role lists keep the given order, lose duplicates and must not end up empty.
fn normalize_roles(roles: &[Role]) -> Result<Vec<Role>, Error> {
    let roles = dedup_in_order(roles);
    if roles.is_empty() {
        return Err(Error::validation("an admin user needs at least one role"));
    }
    Ok(roles)
}

impl AggregateRoot<AdminUser> {
    /// Provisioning twice with the same email and roles changes nothing.
    pub fn provision(&mut self, user_id: &str, email: &str, roles: &[Role]) -> Result<(), Error> {
        let user_id = require_text("user_id", user_id)?;
        let email = require_text("email", email)?;
        if !email.contains('@') {
            return Err(Error::validation(format!("`{}` is not an email address", email)));
        }
        let roles = normalize_roles(roles)?;

        if self.state().status.is_some() {
            return if self.state().email == email && self.state().roles == roles {
                Ok(())
            } else {
                Err(Error::validation(format!("admin user `{}` is already provisioned", user_id)))
            };
        }

        self.emit(AdminUserEvent::Provisioned {
            admin_user_id: bound_id(self)?,
            user_id,
            email,
            roles,
        })
    }

    pub fn update_roles(&mut self, roles: &[Role]) -> Result<(), Error> {
        let roles = normalize_roles(roles)?;
        self.ensure_active()?;

        if self.state().roles == roles {
            return Ok(());
        }

        self.emit(AdminUserEvent::RolesUpdated {
            admin_user_id: bound_id(self)?,
            roles,
        })
    }

    pub fn disable(&mut self, reason: Option<String>) -> Result<(), Error> {
        let status = self.state().status;
        match status {
            None => Err(Error::NotFound(format!("admin user `{}`", bound_id(self)?))),
            Some(AdminUserStatus::Disabled) => Ok(()),
            Some(AdminUserStatus::Active) => self.emit(AdminUserEvent::Disabled {
                admin_user_id: bound_id(self)?,
                reason,
            }),
        }
    }

    fn ensure_active(&self) -> Result<(), Error> {
        match self.state().status {
            None => Err(Error::NotFound(format!("admin user `{}`", bound_id(self)?))),
            Some(AdminUserStatus::Disabled) => Err(Error::validation("admin user is disabled")),
            Some(AdminUserStatus::Active) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionAdminUser {
    pub tenant_id: String,
    pub user_id: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for ProvisionAdminUser {
    type Output = AdminUserView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAdminUserRoles {
    pub tenant_id: String,
    pub user_id: String,
    pub roles: Vec<Role>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for UpdateAdminUserRoles {
    type Output = AdminUserView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisableAdminUser {
    pub tenant_id: String,
    pub user_id: String,
    pub reason: Option<String>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

impl Command for DisableAdminUser {
    type Output = AdminUserView;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAdminUser {
    pub tenant_id: String,
    pub user_id: String,
}

impl Query for GetAdminUser {
    type Output = Option<AdminUserView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListAdminUsers {
    pub tenant_id: String,
}

impl Query for ListAdminUsers {
    type Output = Vec<AdminUserView>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminUserView {
    pub tenant_id: String,
    pub user_id: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub status: AdminUserStatus,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

/// Keeps [`AdminUserView`]s up to date.
pub struct AdminUserProjection {
    read_models: Arc<dyn ReadModelStore<AdminUserView>>,
}

impl AdminUserProjection {
    pub fn new(read_models: Arc<dyn ReadModelStore<AdminUserView>>) -> Self {
        Self { read_models }
    }
}

#[async_trait]
impl EventHandler<AdminUser> for AdminUserProjection {
    async fn handle(&self, envelope: &Envelope<AdminUser>) -> Result<(), Error> {
        let (tenant_id, user_id) = read_model_key::<AdminUser>(envelope)?;

        let view = match &envelope.payload {
            AdminUserEvent::Provisioned { email, roles, .. } => AdminUserView {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                email: email.clone(),
                roles: roles.clone(),
                status: AdminUserStatus::Active,
                version: envelope.version,
                updated_at: envelope.occurred_on,
            },
            event => {
                let mut view = self
                    .read_models
                    .get(tenant_id, user_id)
                    .await?
                    .ok_or_else(|| missing_read_model("admin user", tenant_id, user_id))?;
                match event {
                    AdminUserEvent::RolesUpdated { roles, .. } => view.roles = roles.clone(),
                    AdminUserEvent::Disabled { .. } => view.status = AdminUserStatus::Disabled,
                    AdminUserEvent::Provisioned { .. } => {}
                }
                view.version = envelope.version;
                view.updated_at = envelope.occurred_on;
                view
            }
        };

        self.read_models.upsert(tenant_id, user_id, view).await
    }
}

impl ReplayableEventHandler<AdminUser> for AdminUserProjection {}

/// Handles the admin user commands and queries.
pub struct AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser>,
{
    aggregates: Arc<AggregateStore<E>>,
    read_models: Arc<dyn ReadModelStore<AdminUserView>>,
}

impl<E> AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser> + 'static,
{
    pub fn new(aggregates: Arc<AggregateStore<E>>, read_models: Arc<dyn ReadModelStore<AdminUserView>>) -> Self {
        Self {
            aggregates,
            read_models,
        }
    }

    /// Registers a handler for every admin user command and query.
    pub fn register(&self, commands: &mut CommandDispatcher, queries: &mut QueryDispatcher) -> Result<(), Error> {
        commands
            .register::<ProvisionAdminUser>(self.clone())?
            .register::<UpdateAdminUserRoles>(self.clone())?
            .register::<DisableAdminUser>(self.clone())?;
        queries
            .register::<GetAdminUser>(self.clone())?
            .register::<ListAdminUsers>(self.clone())?;
        Ok(())
    }

    async fn view(&self, tenant_id: &str, user_id: &str) -> Result<AdminUserView, Error> {
        self.read_models
            .get(tenant_id, user_id)
            .await?
            .ok_or_else(|| missing_read_model("admin user", tenant_id, user_id))
    }
}

impl<E> Clone for AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser>,
{
    fn clone(&self) -> Self {
        Self {
            aggregates: Arc::clone(&self.aggregates),
            read_models: Arc::clone(&self.read_models),
        }
    }
}

#[async_trait]
impl<E> CommandHandler<ProvisionAdminUser> for AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser> + 'static,
{
    async fn handle(&self, command: ProvisionAdminUser, cancellation: &CancellationToken) -> Result<AdminUserView, Error> {
        let user_id = require_text("user_id", &command.user_id)?;
        let id = aggregate_id::<AdminUser>(&command.tenant_id, &user_id);
        let metadata = command_metadata(
            &command.tenant_id,
            &user_id,
            &command.requested_by,
            command.requested_at,
            "ProvisionAdminUser",
        );

        self.aggregates
            .update(&id, metadata, cancellation, |user| {
                user.provision(&user_id, &command.email, &command.roles)
            })
            .await?;

        self.view(&command.tenant_id, &user_id).await
    }
}

#[async_trait]
impl<E> CommandHandler<UpdateAdminUserRoles> for AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser> + 'static,
{
    async fn handle(&self, command: UpdateAdminUserRoles, cancellation: &CancellationToken) -> Result<AdminUserView, Error> {
        let user_id = require_text("user_id", &command.user_id)?;
        let id = aggregate_id::<AdminUser>(&command.tenant_id, &user_id);
        let metadata = command_metadata(
            &command.tenant_id,
            &user_id,
            &command.requested_by,
            command.requested_at,
            "UpdateAdminUserRoles",
        );

        self.aggregates
            .update(&id, metadata, cancellation, |user| user.update_roles(&command.roles))
            .await?;

        self.view(&command.tenant_id, &user_id).await
    }
}

#[async_trait]
impl<E> CommandHandler<DisableAdminUser> for AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser> + 'static,
{
    async fn handle(&self, command: DisableAdminUser, cancellation: &CancellationToken) -> Result<AdminUserView, Error> {
        let user_id = require_text("user_id", &command.user_id)?;
        let id = aggregate_id::<AdminUser>(&command.tenant_id, &user_id);
        let metadata = command_metadata(
            &command.tenant_id,
            &user_id,
            &command.requested_by,
            command.requested_at,
            "DisableAdminUser",
        );
        let reason = command.reason.clone();

        self.aggregates
            .update(&id, metadata, cancellation, |user| user.disable(reason))
            .await?;

        self.view(&command.tenant_id, &user_id).await
    }
}

#[async_trait]
impl<E> QueryHandler<GetAdminUser> for AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser> + 'static,
{
    async fn handle(&self, query: GetAdminUser, cancellation: &CancellationToken) -> Result<Option<AdminUserView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.read_models.get(&query.tenant_id, query.user_id.trim()).await
    }
}

#[async_trait]
impl<E> QueryHandler<ListAdminUsers> for AdminUserService<E>
where
    E: EventStore<Aggregate = AdminUser> + 'static,
{
    async fn handle(&self, query: ListAdminUsers, cancellation: &CancellationToken) -> Result<Vec<AdminUserView>, Error> {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.read_models.list(&query.tenant_id).await
    }
}
