//! Message body encoding.
//!
//! Bodies are JSON objects following the schemas in `tierflow_core::messages`.
//! A body may also arrive wrapped by a pub/sub fan-out hop as
//! `{"Message": "<json string>", ...}`; such envelopes are unwrapped before
//! decoding so the request topic can feed the request queue directly.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Field carrying the inner payload of a pub/sub envelope.
const ENVELOPE_FIELD: &str = "Message";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("envelope payload is not valid JSON: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("body does not match the message schema: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Decode a queue body into a typed message.
pub fn decode_body<M: DeserializeOwned>(body: &str) -> Result<M, DecodeError> {
    let value: JsonValue = serde_json::from_str(body).map_err(DecodeError::Json)?;
    let value = unwrap_envelope(value)?;
    serde_json::from_value(value).map_err(DecodeError::Schema)
}

/// Encode a typed message as a queue body.
pub fn encode_body<M: Serialize + ?Sized>(message: &M) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

fn unwrap_envelope(value: JsonValue) -> Result<JsonValue, DecodeError> {
    let inner = match &value {
        JsonValue::Object(map) if !map.contains_key("job_id") => match map.get(ENVELOPE_FIELD) {
            Some(JsonValue::String(inner)) => Some(inner.clone()),
            _ => None,
        },
        _ => None,
    };

    match inner {
        Some(inner) => serde_json::from_str(&inner).map_err(DecodeError::Envelope),
        None => Ok(value),
    }
}
