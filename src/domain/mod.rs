//! The administrative domain: expert advisors, copy-trade groups, admin users and integration
//! events. Each submodule holds the aggregate, its commands and queries, the read model with its
//! projection, and the service handling them.

use chrono::{DateTime, Utc};

use crate::id::derive_id;
use crate::root::AggregateRoot;
use crate::store::Envelope;
use crate::types::Metadata;
use crate::{Aggregate, Error};

pub mod admin_user;
pub mod advisor;
pub mod copy_group;
pub mod integration;

pub const TENANT_ID: &str = "tenant_id";
pub const BUSINESS_ID: &str = "business_id";
pub const REQUESTED_BY: &str = "requested_by";
pub const REQUESTED_AT: &str = "requested_at";
pub const COMMAND: &str = "command";

/// Aggregate id of the `A` identified by `business_id` within a tenant.
pub fn aggregate_id<A>(tenant_id: &str, business_id: &str) -> String
where
    A: Aggregate,
{
    derive_id(&format!("{}/{}", tenant_id, A::NAME), business_id)
}

/// Routing metadata written on every envelope appended by a command.
pub(crate) fn command_metadata(
    tenant_id: &str,
    business_id: &str,
    requested_by: &str,
    requested_at: DateTime<Utc>,
    command: &'static str,
) -> Metadata {
    Metadata::from([
        (TENANT_ID.to_string(), tenant_id.to_string()),
        (BUSINESS_ID.to_string(), business_id.to_string()),
        (REQUESTED_BY.to_string(), requested_by.to_string()),
        (REQUESTED_AT.to_string(), requested_at.to_rfc3339()),
        (COMMAND.to_string(), command.to_string()),
    ])
}

/// The `(tenant_id, business_id)` key a projection writes to.
pub(crate) fn read_model_key<A>(envelope: &Envelope<A>) -> Result<(&str, &str), Error>
where
    A: Aggregate,
{
    let get = |key: &str| {
        envelope.metadata_value(key).ok_or_else(|| {
            Error::validation(format!(
                "envelope {} of `{}` has no `{}` metadata",
                envelope.id, envelope.aggregate_id, key
            ))
        })
    };

    Ok((get(TENANT_ID)?, get(BUSINESS_ID)?))
}

pub(crate) fn bound_id<A>(aggregate: &AggregateRoot<A>) -> Result<String, Error>
where
    A: Aggregate,
{
    aggregate
        .id()
        .map(str::to_string)
        .ok_or_else(|| Error::validation(format!("{} has no id", A::NAME)))
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<String, Error> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::validation(format!("{} must not be blank", field)))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Removes duplicates, keeping the first occurrence of each value.
pub(crate) fn dedup_in_order<T>(values: &[T]) -> Vec<T>
where
    T: PartialEq + Clone,
{
    values.iter().fold(vec![], |mut unique, value| {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
        unique
    })
}

pub(crate) fn missing_read_model(kind: &str, tenant_id: &str, business_id: &str) -> Error {
    Error::NotFound(format!("{} `{}` in tenant `{}`", kind, business_id, tenant_id))
}
