use std::collections::BTreeMap;

/// Position of an event within its aggregate stream. The first event has version 0.
pub type Version = i64;

/// Version of an aggregate without any persisted event.
pub const EMPTY_VERSION: Version = -1;

/// Routing data attached to every envelope of an appended batch.
pub type Metadata = BTreeMap<String, String>;
