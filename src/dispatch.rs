use std::any::{type_name, Any, TypeId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerKind;
use crate::idempotency::IdempotencyStore;
use crate::Error;

/// An intent to change one aggregate. Every command type is routed to exactly one handler.
pub trait Command: Send + 'static {
    type Output: Send + 'static;
}

/// A read request. Every query type is routed to exactly one handler.
pub trait Query: Send + 'static {
    type Output: Send + 'static;
}

#[async_trait]
pub trait CommandHandler<C>: Send + Sync
where
    C: Command,
{
    async fn handle(&self, command: C, cancellation: &CancellationToken) -> Result<C::Output, Error>;
}

#[async_trait]
pub trait QueryHandler<Q>: Send + Sync
where
    Q: Query,
{
    async fn handle(&self, query: Q, cancellation: &CancellationToken) -> Result<Q::Output, Error>;
}

/// Handlers keyed by the [`TypeId`] of the value they handle. Each entry holds an
/// `Arc<dyn CommandHandler<C>>` (or `QueryHandler<Q>`) for the matching `C`.
struct HandlerRegistry {
    kind: HandlerKind,
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    fn new(kind: HandlerKind) -> Self {
        Self {
            kind,
            handlers: HashMap::new(),
        }
    }

    fn insert<T, H>(&mut self, handler: H) -> Result<(), Error>
    where
        T: 'static,
        H: Any + Send + Sync,
    {
        match self.handlers.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(Error::DuplicateHandler {
                kind: self.kind,
                type_name: type_name::<T>(),
            }),
            Entry::Vacant(entry) => {
                let _ = entry.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    fn get<T, H>(&self) -> Result<&H, Error>
    where
        T: 'static,
        H: Any,
    {
        self.handlers
            .get(&TypeId::of::<T>())
            .and_then(|handler| handler.downcast_ref::<H>())
            .ok_or_else(|| Error::HandlerNotFound {
                kind: self.kind,
                type_name: type_name::<T>(),
            })
    }

    fn contains<T>(&self) -> bool
    where
        T: 'static,
    {
        self.handlers.contains_key(&TypeId::of::<T>())
    }
}

/// Routes a command to the single handler registered for its concrete type.
///
/// Registration happens once, at startup; adding a command type only requires registering its
/// handler.
pub struct CommandDispatcher {
    registry: HandlerRegistry,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(HandlerKind::Command),
        }
    }

    /// # Errors
    ///
    /// Fails with [`Error::DuplicateHandler`] if `C` already has a handler.
    pub fn register<C>(&mut self, handler: impl CommandHandler<C> + 'static) -> Result<&mut Self, Error>
    where
        C: Command,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.registry.insert::<C, _>(handler)?;
        Ok(self)
    }

    pub fn handles<C>(&self) -> bool
    where
        C: Command,
    {
        self.registry.contains::<C>()
    }

    /// # Errors
    ///
    /// Fails with [`Error::HandlerNotFound`] if nothing is registered for `C`, otherwise returns
    /// whatever the handler returns.
    #[tracing::instrument(skip_all, fields(command = type_name::<C>()))]
    pub async fn dispatch<C>(&self, command: C, cancellation: &CancellationToken) -> Result<C::Output, Error>
    where
        C: Command,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::clone(self.registry.get::<C, Arc<dyn CommandHandler<C>>>()?);
        handler.handle(command, cancellation).await
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes a query to the single handler registered for its concrete type.
pub struct QueryDispatcher {
    registry: HandlerRegistry,
}

impl QueryDispatcher {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(HandlerKind::Query),
        }
    }

    /// # Errors
    ///
    /// Fails with [`Error::DuplicateHandler`] if `Q` already has a handler.
    pub fn register<Q>(&mut self, handler: impl QueryHandler<Q> + 'static) -> Result<&mut Self, Error>
    where
        Q: Query,
    {
        let handler: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        self.registry.insert::<Q, _>(handler)?;
        Ok(self)
    }

    pub fn handles<Q>(&self) -> bool
    where
        Q: Query,
    {
        self.registry.contains::<Q>()
    }

    /// # Errors
    ///
    /// Fails with [`Error::HandlerNotFound`] if nothing is registered for `Q`.
    #[tracing::instrument(skip_all, fields(query = type_name::<Q>()))]
    pub async fn dispatch<Q>(&self, query: Q, cancellation: &CancellationToken) -> Result<Q::Output, Error>
    where
        Q: Query,
    {
        let handler: Arc<dyn QueryHandler<Q>> = Arc::clone(self.registry.get::<Q, Arc<dyn QueryHandler<Q>>>()?);
        handler.handle(query, cancellation).await
    }
}

impl Default for QueryDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs commands at most once per `(tenant_id, idempotency key)`.
///
/// The first submission executes and its output is stored; replays with the same payload hash get
/// the stored output back without executing anything. A command whose events were committed but
/// whose publishing failed is run again by the next replay, so commands must converge: re-issuing
/// one whose outcome already holds emits nothing.
pub struct IdempotentCommandDispatcher<S>
where
    S: IdempotencyStore,
{
    dispatcher: Arc<CommandDispatcher>,
    store: S,
}

impl<S> IdempotentCommandDispatcher<S>
where
    S: IdempotencyStore,
{
    pub fn new(dispatcher: Arc<CommandDispatcher>, store: S) -> Self {
        Self { dispatcher, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// # Errors
    ///
    /// - [`Error::IdempotencyKeyReused`] if the key was used for another payload;
    /// - [`Error::IdempotencyInProgress`] if the first execution under the key is still running;
    /// - any error of the command itself. Failures that did not commit anything release the key.
    ///   Failures after the events were committed suspend it: the next submission with the same
    ///   payload runs the command again, which emits nothing new, and stores its output.
    #[tracing::instrument(skip_all, fields(tenant_id = %tenant_id, idempotency_key = %key, command = type_name::<C>()))]
    pub async fn dispatch<C>(
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
        let outcome = self.store.try_store(tenant_id, key, payload_hash).await?;

        if !outcome.is_new {
            if let Some(response) = outcome.cached_response {
                tracing::debug!("replaying stored response");
                return Ok(serde_json::from_value(response)?);
            }
            if !outcome.resume {
                return Err(Error::IdempotencyInProgress {
                    tenant_id: tenant_id.to_string(),
                    key: key.to_string(),
                });
            }

            tracing::info!("resuming execution that committed without a response");
            return match self.dispatcher.dispatch(command, cancellation).await {
                Ok(output) => self.complete(tenant_id, key, output).await,
                Err(error) => {
                    self.store.suspend(tenant_id, key).await?;
                    Err(error)
                }
            };
        }

        match self.dispatcher.dispatch(command, cancellation).await {
            Ok(output) => self.complete(tenant_id, key, output).await,
            Err(error) if error.is_committed() => {
                self.store.suspend(tenant_id, key).await?;
                Err(error)
            }
            Err(error) => {
                self.store.release(tenant_id, key).await?;
                Err(error)
            }
        }
    }

    async fn complete<O>(&self, tenant_id: &str, key: &str, output: O) -> Result<O, Error>
    where
        O: Serialize,
    {
        self.store
            .complete(tenant_id, key, serde_json::to_value(&output)?)
            .await?;
        Ok(output)
    }
}
