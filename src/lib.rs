//! Administrative backend of a multi-tenant trading-automation platform.
//!
//! Expert advisors, copy-trade groups, admin users and integration events are event-sourced
//! aggregates: every change is an ordered, append-only event stream guarded by optimistic
//! concurrency, and reads are served from projections kept up to date after each append.

pub use crate::aggregate::Aggregate;
pub use crate::backend::{Backend, EventStoreRef, EventStores, ReadModels};
pub use crate::config::Settings;
pub use crate::error::Error;
pub use crate::event::{DomainEvent, EventEnvelope};
pub use crate::manager::AggregateStore;
pub use crate::root::AggregateRoot;

mod aggregate;
mod backend;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
mod event;
pub mod handler;
pub mod id;
pub mod idempotency;
mod manager;
pub mod publisher;
pub mod read_model;
pub mod rebuilder;
mod root;
pub mod store;
pub mod types;
