//! Serialization boundary.
//!
//! Keys, wire payloads, and typed values all pass through this one
//! encode/decode pair, so every byte the crate persists or sends is produced
//! by the same deterministic bincode configuration.

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialize a value to its canonical byte representation.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a value from bytes produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
