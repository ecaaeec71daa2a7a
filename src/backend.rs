use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::dispatch::{Command, CommandDispatcher, IdempotentCommandDispatcher, Query, QueryDispatcher};
use crate::domain::admin_user::{AdminUser, AdminUserProjection, AdminUserService, AdminUserView};
use crate::domain::advisor::{AdvisorProjection, AdvisorService, AdvisorView, ExpertAdvisor};
use crate::domain::copy_group::{CopyGroupProjection, CopyGroupService, CopyGroupView, CopyTradeGroup};
use crate::domain::integration::{
    IntegrationEvent, IntegrationEventProjection, IntegrationEventService, IntegrationEventView,
};
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::manager::AggregateStore;
use crate::publisher::DomainEventPublisher;
use crate::read_model::{InMemoryReadModelStore, ReadModelStore};
use crate::rebuilder::Rebuilder;
use crate::store::{EventStore, InMemoryEventStore};
use crate::{Aggregate, Error};

/// Shared handle to the event store of one aggregate type.
pub type EventStoreRef<A> = Arc<dyn EventStore<Aggregate = A>>;

/// One event store per aggregate type.
pub struct EventStores {
    pub advisors: EventStoreRef<ExpertAdvisor>,
    pub copy_groups: EventStoreRef<CopyTradeGroup>,
    pub admin_users: EventStoreRef<AdminUser>,
    pub integration_events: EventStoreRef<IntegrationEvent>,
}

impl EventStores {
    pub fn in_memory() -> Self {
        Self {
            advisors: Arc::new(InMemoryEventStore::<ExpertAdvisor>::new()),
            copy_groups: Arc::new(InMemoryEventStore::<CopyTradeGroup>::new()),
            admin_users: Arc::new(InMemoryEventStore::<AdminUser>::new()),
            integration_events: Arc::new(InMemoryEventStore::<IntegrationEvent>::new()),
        }
    }

    /// Builds (and migrates) one postgres table per aggregate type.
    #[cfg(feature = "postgres")]
    pub async fn postgres(pool: sqlx::Pool<sqlx::Postgres>) -> Result<Self, Error> {
        use crate::store::postgres::PgEventStoreBuilder;

        Ok(Self {
            advisors: Arc::new(PgEventStoreBuilder::<ExpertAdvisor>::new(pool.clone()).try_build().await?),
            copy_groups: Arc::new(PgEventStoreBuilder::<CopyTradeGroup>::new(pool.clone()).try_build().await?),
            admin_users: Arc::new(PgEventStoreBuilder::<AdminUser>::new(pool.clone()).try_build().await?),
            integration_events: Arc::new(PgEventStoreBuilder::<IntegrationEvent>::new(pool).try_build().await?),
        })
    }
}

/// One read model store per projection.
pub struct ReadModels {
    pub advisors: Arc<dyn ReadModelStore<AdvisorView>>,
    pub copy_groups: Arc<dyn ReadModelStore<CopyGroupView>>,
    pub admin_users: Arc<dyn ReadModelStore<AdminUserView>>,
    pub integration_events: Arc<dyn ReadModelStore<IntegrationEventView>>,
}

impl ReadModels {
    pub fn in_memory() -> Self {
        Self {
            advisors: Arc::new(InMemoryReadModelStore::<AdvisorView>::new()),
            copy_groups: Arc::new(InMemoryReadModelStore::<CopyGroupView>::new()),
            admin_users: Arc::new(InMemoryReadModelStore::<AdminUserView>::new()),
            integration_events: Arc::new(InMemoryReadModelStore::<IntegrationEventView>::new()),
        }
    }
}

/// Rebuilds every projection from the event log.
struct Repair {
    advisors: Rebuilder<EventStoreRef<ExpertAdvisor>>,
    copy_groups: Rebuilder<EventStoreRef<CopyTradeGroup>>,
    admin_users: Rebuilder<EventStoreRef<AdminUser>>,
    integration_events: Rebuilder<EventStoreRef<IntegrationEvent>>,
}

/// The composition root: every aggregate wired to its event store, publisher and projection, and
/// every command and query registered with the dispatchers.
pub struct Backend {
    commands: Arc<CommandDispatcher>,
    queries: QueryDispatcher,
    idempotent: IdempotentCommandDispatcher<InMemoryIdempotencyStore>,
    repair: Repair,
}

fn aggregate_store<A>(
    event_store: &EventStoreRef<A>,
    publisher: DomainEventPublisher<A>,
) -> Arc<AggregateStore<EventStoreRef<A>>>
where
    A: Aggregate,
{
    Arc::new(AggregateStore::new(Arc::clone(event_store), publisher))
}

impl Backend {
    /// Everything in process memory. State is lost with the process.
    pub fn in_memory(settings: &Settings) -> Result<Self, Error> {
        Self::new(settings, EventStores::in_memory(), ReadModels::in_memory())
    }

    /// Event streams in postgres, at [`Settings::postgres_url`]; read models in memory, rebuilt
    /// from the streams at startup.
    #[cfg(feature = "postgres")]
    pub async fn postgres(settings: &Settings) -> Result<Self, Error> {
        let url = settings
            .postgres_url()
            .ok_or_else(|| Error::validation(format!("{} is not set", crate::config::DATABASE_URL_ENV)))?;
        let pool = sqlx::postgres::PgPoolOptions::new().connect(&url).await?;

        let backend = Self::new(settings, EventStores::postgres(pool).await?, ReadModels::in_memory())?;
        backend.repair_read_models().await?;
        Ok(backend)
    }

    pub fn new(settings: &Settings, event_stores: EventStores, read_models: ReadModels) -> Result<Self, Error> {
        let mut commands = CommandDispatcher::new();
        let mut queries = QueryDispatcher::new();

        AdvisorService::new(
            aggregate_store(
                &event_stores.advisors,
                DomainEventPublisher::new().subscribe_all(AdvisorProjection::new(Arc::clone(&read_models.advisors))),
            ),
            Arc::clone(&read_models.advisors),
        )
        .register(&mut commands, &mut queries)?;

        CopyGroupService::new(
            aggregate_store(
                &event_stores.copy_groups,
                DomainEventPublisher::new()
                    .subscribe_all(CopyGroupProjection::new(Arc::clone(&read_models.copy_groups))),
            ),
            Arc::clone(&read_models.copy_groups),
        )
        .register(&mut commands, &mut queries)?;

        AdminUserService::new(
            aggregate_store(
                &event_stores.admin_users,
                DomainEventPublisher::new()
                    .subscribe_all(AdminUserProjection::new(Arc::clone(&read_models.admin_users))),
            ),
            Arc::clone(&read_models.admin_users),
        )
        .register(&mut commands, &mut queries)?;

        IntegrationEventService::new(
            aggregate_store(
                &event_stores.integration_events,
                DomainEventPublisher::new().subscribe_all(IntegrationEventProjection::new(Arc::clone(
                    &read_models.integration_events,
                ))),
            ),
            Arc::clone(&read_models.integration_events),
        )
        .register(&mut commands, &mut queries)?;

        let repair = Repair {
            advisors: Rebuilder::new(Arc::clone(&event_stores.advisors))
                .add_event_handler(AdvisorProjection::new(Arc::clone(&read_models.advisors))),
            copy_groups: Rebuilder::new(Arc::clone(&event_stores.copy_groups))
                .add_event_handler(CopyGroupProjection::new(Arc::clone(&read_models.copy_groups))),
            admin_users: Rebuilder::new(Arc::clone(&event_stores.admin_users))
                .add_event_handler(AdminUserProjection::new(Arc::clone(&read_models.admin_users))),
            integration_events: Rebuilder::new(Arc::clone(&event_stores.integration_events)).add_event_handler(
                IntegrationEventProjection::new(Arc::clone(&read_models.integration_events)),
            ),
        };

        let commands = Arc::new(commands);
        let idempotent = IdempotentCommandDispatcher::new(
            Arc::clone(&commands),
            InMemoryIdempotencyStore::new(settings.idempotency_ttl()),
        );

        tracing::info!(idempotency_ttl = ?settings.idempotency_ttl, "backend ready");

        Ok(Self {
            commands,
            queries,
            idempotent,
            repair,
        })
    }

    pub fn commands(&self) -> &CommandDispatcher {
        &self.commands
    }

    pub fn queries(&self) -> &QueryDispatcher {
        &self.queries
    }

    pub fn idempotency_store(&self) -> &InMemoryIdempotencyStore {
        self.idempotent.store()
    }

    pub async fn execute<C>(&self, command: C, cancellation: &CancellationToken) -> Result<C::Output, Error>
    where
        C: Command,
    {
        self.commands.dispatch(command, cancellation).await
    }

    /// Executes `command` at most once per `(tenant_id, key)`. See
    /// [`IdempotentCommandDispatcher::dispatch`].
    pub async fn execute_idempotent<C>(
        &self,
        tenant_id: &str,
        key: &str,
        payload_hash: &str,
        command: C,
        cancellation: &CancellationToken,
    ) -> Result<C::Output, Error>
    where
        C: Command,
        C::Output: Serialize + DeserializeOwned,
    {
        self.idempotent
            .dispatch(tenant_id, key, payload_hash, command, cancellation)
            .await
    }

    pub async fn query<Q>(&self, query: Q, cancellation: &CancellationToken) -> Result<Q::Output, Error>
    where
        Q: Query,
    {
        self.queries.dispatch(query, cancellation).await
    }

    /// Replays every event stream into the projections. Returns the number of replayed envelopes.
    #[tracing::instrument(skip_all, err)]
    pub async fn repair_read_models(&self) -> Result<usize, Error> {
        Ok(self.repair.advisors.all_aggregates().await?
            + self.repair.copy_groups.all_aggregates().await?
            + self.repair.admin_users.all_aggregates().await?
            + self.repair.integration_events.all_aggregates().await?)
    }

    /// Drops idempotency records past their time to live.
    pub async fn purge_expired_idempotency_keys(&self) -> Result<usize, Error> {
        self.idempotent.store().purge_expired().await
    }
}
