use std::fmt::{Display, Formatter};

use uuid::Uuid;

use crate::types::Version;

/// Which dispatcher a handler lookup was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Command,
    Query,
}

impl Display for HandlerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Query => write!(f, "query"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The stream moved past the version the caller loaded. The caller may reload and retry.
    #[error("concurrency conflict on aggregate `{aggregate_id}`: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: Version,
        actual: Version,
    },
    /// An event declared an aggregate id different from the one the aggregate is bound to.
    #[error("identity mismatch: aggregate `{expected}` received an event for `{found}`")]
    IdentityMismatch { expected: String, found: String },
    /// The persisted history is not a contiguous, ordered sequence of versions.
    #[error("version gap in aggregate `{aggregate_id}`: expected version {expected}, found {found}")]
    VersionGap {
        aggregate_id: String,
        expected: Version,
        found: Version,
    },
    #[error("no {kind} handler registered for `{type_name}`")]
    HandlerNotFound {
        kind: HandlerKind,
        type_name: &'static str,
    },
    #[error("a {kind} handler is already registered for `{type_name}`")]
    DuplicateHandler {
        kind: HandlerKind,
        type_name: &'static str,
    },
    /// Same idempotency key, different request body.
    #[error("idempotency key `{key}` was already used with a different payload in tenant `{tenant_id}`")]
    IdempotencyKeyReused { tenant_id: String, key: String },
    /// The first request under this key is still running.
    #[error("request with idempotency key `{key}` in tenant `{tenant_id}` has no stored response")]
    IdempotencyInProgress { tenant_id: String, key: String },
    /// Business rule rejected the command before anything was emitted.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// A handler failed after the batch was durably appended. The append stands.
    #[error("event `{event_id}` (aggregate `{aggregate_id}`, version {version}) was committed but handler `{handler}` failed")]
    Publish {
        event_id: Uuid,
        aggregate_id: String,
        version: Version,
        handler: &'static str,
        #[source]
        source: Box<Error>,
    },
    /// Cancellation arrived after the batch was durably appended. The append stands.
    #[error("publishing for aggregate `{aggregate_id}` was cancelled after committing version {committed_version}")]
    PublishCancelled {
        aggregate_id: String,
        committed_version: Version,
    },
    /// Cancellation arrived before any durable write.
    #[error("operation cancelled")]
    Cancelled,
    /// Serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Sql error
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Only optimistic concurrency failures are worth a reload-and-retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// True when the events behind this error are already durable.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Publish { .. } | Self::PublishCancelled { .. })
    }
}
