use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::models::Reading;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("missing required field {0:?}")]
    MissingField(&'static str),

    #[error("field {field:?} is not a number: {value}")]
    NotANumber { field: &'static str, value: String },
}

/// Decode a raw feed payload such as
/// `{"Temperature": 21.4, "Humidity": "48.2", "Pressure": 1012}`
/// into a pending [`Reading`] captured at `now`.
///
/// Numbers and numeric strings are both accepted. Values that do not coerce
/// to a finite `f64` are rejected, since the outgoing document is JSON and
/// cannot carry NaN or infinity.
pub fn decode(payload: &[u8], device_id: &str, now: DateTime<Utc>) -> Result<Reading, DecodeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(fields) = &value else {
        return Err(DecodeError::Malformed(format!("expected an object, got {value}")));
    };

    let temperature = number_field(fields, "Temperature")?;
    let humidity = number_field(fields, "Humidity")?;
    let pressure = number_field(fields, "Pressure")?;

    Ok(Reading::pending(device_id, temperature, humidity, pressure, now))
}

fn number_field(fields: &Map<String, Value>, name: &'static str) -> Result<f64, DecodeError> {
    let value = fields.get(name).ok_or(DecodeError::MissingField(name))?;
    let not_a_number = || DecodeError::NotANumber {
        field: name,
        value: value.to_string(),
    };

    let n = match value {
        Value::Number(n) => n.as_f64().ok_or_else(not_a_number)?,
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| not_a_number())?,
        _ => return Err(not_a_number()),
    };

    if !n.is_finite() {
        return Err(not_a_number());
    }
    Ok(n)
}
