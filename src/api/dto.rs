use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::{
    models::{Reading, ReadingStatus},
    queue::QueueStats,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadingDto {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub captured_at: DateTime<Utc>,
    pub status: ReadingStatus,
    /// Error from the most recent failed delivery attempt, if any.
    pub last_error: Option<String>,
}

impl From<Reading> for ReadingDto {
    fn from(r: Reading) -> Self {
        Self {
            device_id: r.device_id,
            temperature: r.temperature,
            humidity: r.humidity,
            pressure: r.pressure,
            captured_at: r.captured_at,
            status: r.status,
            last_error: r.last_error,
        }
    }
}

/// Response for `GET /relay/status`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RelayStatusDto {
    /// Readings still waiting to be delivered.
    pub pending: i64,
    /// Readings confirmed by the remote endpoint.
    pub sent: i64,
    /// Capture time of the oldest undelivered reading.
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl From<QueueStats> for RelayStatusDto {
    fn from(s: QueueStats) -> Self {
        Self {
            pending: s.pending,
            sent: s.sent,
            oldest_pending: s.oldest_pending,
        }
    }
}
