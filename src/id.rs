use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::Error;

/// Derives a stable aggregate id from a business key.
///
/// The same `(scope, business_key)` pair always yields the same id, and different scopes never
/// collide in practice, e.g. `derive_id("t1/admin_user", "u1")`.
pub fn derive_id(scope: &str, business_key: &str) -> String {
    let name = format!("{}\u{1f}{}", scope, business_key);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Hex encoded SHA-256 of the JSON representation of a request payload.
pub fn payload_hash<T>(payload: &T) -> Result<String, Error>
where
    T: Serialize + ?Sized,
{
    let bytes: Vec<u8> = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
