use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::SecondsFormat;
use serde::Serialize;
use thiserror::Error;

use crate::db::models::Reading;

// ---------------------------------------------------------------------------
// Device connection string
//
//   HostName=<hub>.azure-devices.net;DeviceId=<id>;SharedAccessKey=<base64>
//
// Segments may come in any order. `GatewayHostName` is present when the device
// talks to the hub through an IoT Edge gateway.
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("connection string segment {0:?} is not of the form key=value")]
    Malformed(String),

    #[error("connection string is missing {0}")]
    Missing(&'static str),

    #[error("SharedAccessKey is not valid base64")]
    InvalidKey,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub gateway_host_name: Option<String>,
    /// Decoded `SharedAccessKey`.
    pub shared_access_key: Vec<u8>,
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut gateway_host_name = None;
        let mut key = None;

        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (k, v) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Malformed(segment.to_owned()))?;
            match k {
                "HostName" => host_name = Some(v.to_owned()),
                "DeviceId" => device_id = Some(v.to_owned()),
                "GatewayHostName" => gateway_host_name = Some(v.to_owned()),
                "SharedAccessKey" => key = Some(v),
                _ => {}
            }
        }

        let key = key.ok_or(ConnectionStringError::Missing("SharedAccessKey"))?;
        Ok(Self {
            host_name: host_name.ok_or(ConnectionStringError::Missing("HostName"))?,
            device_id: device_id.ok_or(ConnectionStringError::Missing("DeviceId"))?,
            gateway_host_name,
            shared_access_key: BASE64
                .decode(key)
                .map_err(|_| ConnectionStringError::InvalidKey)?,
        })
    }
}

// Keeps the key out of logs.
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("gateway_host_name", &self.gateway_host_name)
            .field("shared_access_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Device-to-cloud telemetry document
// ---------------------------------------------------------------------------

/// JSON body of one device-to-cloud message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage<'a> {
    pub device_id: &'a str,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    /// RFC 3339, UTC, microsecond precision.
    pub captured_at: String,
}

impl<'a> From<&'a Reading> for TelemetryMessage<'a> {
    fn from(r: &'a Reading) -> Self {
        Self {
            device_id: &r.device_id,
            temperature: r.temperature,
            humidity: r.humidity,
            pressure: r.pressure,
            captured_at: r.captured_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}
