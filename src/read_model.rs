use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::Error;

/// Per-tenant storage for denormalized projections, keyed by `(tenant_id, business_id)`.
///
/// Rows are written by event handlers and read by query handlers. `list` returns rows in insertion
/// order; updating a row keeps its position.
#[async_trait]
pub trait ReadModelStore<R>: Send + Sync
where
    R: Clone + Send + Sync + 'static,
{
    async fn get(&self, tenant_id: &str, business_id: &str) -> Result<Option<R>, Error>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<R>, Error>;

    async fn upsert(&self, tenant_id: &str, business_id: &str, model: R) -> Result<(), Error>;

    /// Removes a row, returning it if it was there.
    async fn remove(&self, tenant_id: &str, business_id: &str) -> Result<Option<R>, Error>;
}

/// In-process [`ReadModelStore`]. Cloning it shares the same rows.
pub struct InMemoryReadModelStore<R> {
    tenants: Arc<RwLock<HashMap<String, Vec<(String, R)>>>>,
}

impl<R> InMemoryReadModelStore<R> {
    pub fn new() -> Self {
        Self {
            tenants: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<R> Default for InMemoryReadModelStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for InMemoryReadModelStore<R> {
    fn clone(&self) -> Self {
        Self {
            tenants: Arc::clone(&self.tenants),
        }
    }
}

#[async_trait]
impl<R> ReadModelStore<R> for InMemoryReadModelStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn get(&self, tenant_id: &str, business_id: &str) -> Result<Option<R>, Error> {
        Ok(self.tenants.read().await.get(tenant_id).and_then(|rows| {
            rows.iter()
                .find(|(id, _)| id == business_id)
                .map(|(_, model)| model.clone())
        }))
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<R>, Error> {
        Ok(self
            .tenants
            .read()
            .await
            .get(tenant_id)
            .map(|rows| rows.iter().map(|(_, model)| model.clone()).collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, tenant_id: &str, business_id: &str, model: R) -> Result<(), Error> {
        let mut tenants = self.tenants.write().await;
        let rows = tenants.entry(tenant_id.to_string()).or_default();

        match rows.iter_mut().find(|(id, _)| id == business_id) {
            Some((_, existing)) => *existing = model,
            None => rows.push((business_id.to_string(), model)),
        }

        Ok(())
    }

    async fn remove(&self, tenant_id: &str, business_id: &str) -> Result<Option<R>, Error> {
        let mut tenants = self.tenants.write().await;

        Ok(tenants.get_mut(tenant_id).and_then(|rows| {
            rows.iter()
                .position(|(id, _)| id == business_id)
                .map(|index| rows.remove(index).1)
        }))
    }
}
