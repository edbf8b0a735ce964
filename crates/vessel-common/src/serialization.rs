//! JSON helpers over serde_json
//!
//! Timestamps use chrono's serde representation (RFC 3339 / ISO-8601).

use crate::error::SerializationError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize `value` as compact JSON
pub fn serialized<T: Serialize + ?Sized>(value: &T) -> Result<String, SerializationError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a `T` from JSON
pub fn deserialized<T: DeserializeOwned>(json: &str) -> Result<T, SerializationError> {
    Ok(serde_json::from_str(json)?)
}

/// Deserialize a JSON array of `T`
pub fn deserialized_list<T: DeserializeOwned>(json: &str) -> Result<Vec<T>, SerializationError> {
    deserialized(json)
}
