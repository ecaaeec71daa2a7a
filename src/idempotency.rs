use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::Error;

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A request seen under an idempotency key, scoped to its tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub tenant_id: String,
    pub key: String,
    pub payload_hash: String,
    /// Response produced by the first execution, once it completed.
    pub response: Option<Value>,
    /// The first execution committed its events but produced no response. The next replay with the
    /// same payload runs the command again to obtain one.
    pub resumable: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }
}

/// Outcome of [`IdempotencyStore::try_store`].
#[derive(Debug, Clone, PartialEq)]
pub struct TryStoreOutcome {
    /// The key was unseen (or expired): the caller should execute the request.
    pub is_new: bool,
    /// For replays, the response stored by the first execution, if it completed.
    pub cached_response: Option<Value>,
    /// For replays without a response, whether this caller took over a suspended execution.
    pub resume: bool,
}

impl TryStoreOutcome {
    fn new() -> Self {
        Self {
            is_new: true,
            cached_response: None,
            resume: false,
        }
    }

    fn replay(cached_response: Option<Value>, resume: bool) -> Self {
        Self {
            is_new: false,
            cached_response,
            resume,
        }
    }
}

/// Deduplicates request submissions by `(tenant_id, key)` and request payload hash.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `key` for the given payload.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IdempotencyKeyReused`] if the key is live with a different payload hash.
    async fn try_store(&self, tenant_id: &str, key: &str, payload_hash: &str) -> Result<TryStoreOutcome, Error>;

    /// Stores the response of the first execution, to be replayed to later submissions.
    async fn complete(&self, tenant_id: &str, key: &str, response: Value) -> Result<(), Error>;

    /// Forgets a key whose execution failed without side effects, so that it can be submitted again.
    async fn release(&self, tenant_id: &str, key: &str) -> Result<(), Error>;

    /// Marks a key whose execution committed its events but failed before producing a response.
    /// The next [`try_store`](IdempotencyStore::try_store) with the same payload hash takes it over.
    async fn suspend(&self, tenant_id: &str, key: &str) -> Result<(), Error>;

    /// Drops expired records, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, Error>;
}

/// In-process [`IdempotencyStore`] with an optional time to live for its records.
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<(String, String), IdempotencyRecord>>>,
    ttl: Option<Duration>,
    clock: Clock,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(self, clock: Clock) -> Self {
        Self { clock, ..self }
    }

    pub async fn record(&self, tenant_id: &str, key: &str) -> Option<IdempotencyRecord> {
        self.records
            .lock()
            .await
            .get(&scope(tenant_id, key))
            .cloned()
    }
}

impl Clone for InMemoryIdempotencyStore {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            ttl: self.ttl,
            clock: Arc::clone(&self.clock),
        }
    }
}

fn scope(tenant_id: &str, key: &str) -> (String, String) {
    (tenant_id.to_string(), key.to_string())
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_store(&self, tenant_id: &str, key: &str, payload_hash: &str) -> Result<TryStoreOutcome, Error> {
        let now = (self.clock)();
        let mut records = self.records.lock().await;

        if let Some(record) = records.get_mut(&scope(tenant_id, key)) {
            if !record.is_expired(now) {
                if record.payload_hash != payload_hash {
                    tracing::warn!(tenant_id, key, "idempotency key reused with a different payload");
                    return Err(Error::IdempotencyKeyReused {
                        tenant_id: tenant_id.to_string(),
                        key: key.to_string(),
                    });
                }
                let resume = record.response.is_none() && record.resumable;
                record.resumable = false;
                return Ok(TryStoreOutcome::replay(record.response.clone(), resume));
            }
        }

        let record = IdempotencyRecord {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
            payload_hash: payload_hash.to_string(),
            response: None,
            resumable: false,
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };
        records.insert(scope(tenant_id, key), record);

        Ok(TryStoreOutcome::new())
    }

    async fn complete(&self, tenant_id: &str, key: &str, response: Value) -> Result<(), Error> {
        match self.records.lock().await.get_mut(&scope(tenant_id, key)) {
            Some(record) => {
                record.response = Some(response);
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "idempotency key `{}` in tenant `{}`",
                key, tenant_id
            ))),
        }
    }

    async fn release(&self, tenant_id: &str, key: &str) -> Result<(), Error> {
        let _ = self.records.lock().await.remove(&scope(tenant_id, key));
        Ok(())
    }

    async fn suspend(&self, tenant_id: &str, key: &str) -> Result<(), Error> {
        match self.records.lock().await.get_mut(&scope(tenant_id, key)) {
            Some(record) => {
                record.resumable = true;
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "idempotency key `{}` in tenant `{}`",
                key, tenant_id
            ))),
        }
    }

    async fn purge_expired(&self) -> Result<usize, Error> {
        let now = (self.clock)();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}
