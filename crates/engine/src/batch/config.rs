//! Configuration codec: operation parameters plus entity ids to and from a
//! portable JSON payload.
//!
//! Decoding is tolerant of unknown keys so payloads written by newer engine
//! versions still load. Missing required keys and wrong scalar types are
//! rejected as [`EngineError::MalformedConfiguration`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::EngineError;

/// Typed configuration of a batch operation.
pub trait BatchConfiguration:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Payload key holding the entity id list.
    const IDS_FIELD: &'static str;

    fn ids(&self) -> &[String];

    /// Same parameters, different ids.
    fn with_ids(&self, ids: Vec<String>) -> Self;
}

pub fn encode<C: BatchConfiguration>(config: &C) -> Result<Value, EngineError> {
    Ok(serde_json::to_value(config)?)
}

pub fn decode<C: BatchConfiguration>(payload: &Value) -> Result<C, EngineError> {
    Ok(serde_json::from_value(payload.clone())?)
}

/// Build a configuration from an id list and the operation's scalar
/// parameters (a JSON object, or `null` when there are none).
pub fn assemble<C: BatchConfiguration>(ids: Vec<String>, parameters: Value) -> Result<C, EngineError> {
    let mut object = match parameters {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(EngineError::malformed(format!(
                "parameters must be an object, got {other}"
            )));
        }
    };
    object.insert(C::IDS_FIELD.to_string(), Value::from(ids));
    decode(&Value::Object(object))
}

/// Take up to `max_chunks` chunks of at most `chunk_size` ids from the front
/// of `ids`. Returns the chunks and the ids left over.
pub fn split_chunks(ids: &[String], chunk_size: u32, max_chunks: u32) -> (Vec<Vec<String>>, Vec<String>) {
    let chunk_size = chunk_size.max(1) as usize;
    let take = ids.len().min(chunk_size.saturating_mul(max_chunks as usize));

    let chunks = ids[..take].chunks(chunk_size).map(<[String]>::to_vec).collect();
    (chunks, ids[take..].to_vec())
}
