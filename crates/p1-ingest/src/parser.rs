//! Meter payload parser
//!
//! Maps the JSON snapshot served by the meter's local API into a [`Reading`]
//! and its [`ExternalReading`]s. Absent keys, `null`s and mistyped values
//! default to zero/empty and unknown keys are ignored, so firmware that adds,
//! drops or retypes fields still parses. Only a payload that is not a JSON
//! object is rejected.

use serde::Deserialize;
use thiserror::Error;

use crate::models::{lenient, ExternalReading, ParsedReading, Reading};

/// Payload could not be read as a meter snapshot
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed meter payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct MeterPayload {
    #[serde(flatten)]
    reading: Reading,
    #[serde(default, alias = "externals", deserialize_with = "lenient::or_default")]
    external: Vec<ExternalReading>,
}

/// Parse one raw meter payload
pub fn parse_reading(payload: &[u8]) -> Result<ParsedReading, ParseError> {
    // creation time is assigned at persist time, never taken from the wire
    let MeterPayload { reading, external } = serde_json::from_slice(payload)?;

    Ok(ParsedReading {
        reading,
        externals: external,
    })
}
