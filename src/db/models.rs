use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use utoipa::ToSchema;

/// Mirrors the `status` column of the `readings` table.
///
/// The only legal transition is `Pending → Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Pending,
    Sent,
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadingStatus::Pending => "pending",
            ReadingStatus::Sent => "sent",
        };
        f.write_str(s)
    }
}

/// One timestamped sensor observation together with its delivery status.
///
/// `(device_id, captured_at)` is the natural key of a reading. The queue
/// stores `captured_at` with microsecond precision, so callers should build
/// timestamps through [`truncate_to_micros`] to compare against stored rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub captured_at: DateTime<Utc>,
    pub status: ReadingStatus,
    /// Set on the most recent failed delivery attempt, cleared on success.
    pub last_error: Option<String>,
}

impl Reading {
    /// Build a freshly captured reading. Readings only ever start out pending.
    pub fn pending(
        device_id: impl Into<String>,
        temperature: f64,
        humidity: f64,
        pressure: f64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            temperature,
            humidity,
            pressure,
            captured_at: truncate_to_micros(captured_at),
            status: ReadingStatus::Pending,
            last_error: None,
        }
    }

    pub fn captured_at_us(&self) -> i64 {
        self.captured_at.timestamp_micros()
    }
}

impl<'r> FromRow<'r, SqliteRow> for Reading {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let captured_at_us: i64 = row.try_get("captured_at_us")?;
        let captured_at =
            DateTime::<Utc>::from_timestamp_micros(captured_at_us).ok_or_else(|| {
                sqlx::Error::ColumnDecode {
                    index: "captured_at_us".to_owned(),
                    source: format!("timestamp out of range: {captured_at_us}").into(),
                }
            })?;

        Ok(Self {
            device_id: row.try_get("device_id")?,
            temperature: row.try_get("temperature")?,
            humidity: row.try_get("humidity")?,
            pressure: row.try_get("pressure")?,
            captured_at,
            status: row.try_get("status")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

/// Drop sub-microsecond precision so an in-memory timestamp equals what the
/// queue hands back after a round trip through storage.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn pending_constructor_starts_pending_without_error() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let r = Reading::pending("pi", 21.5, 40.0, 1013.2, ts);
        assert_eq!(r.status, ReadingStatus::Pending);
        assert!(r.last_error.is_none());
        assert_eq!(r.captured_at, ts);
    }

    #[test]
    fn nanoseconds_are_truncated() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let r = Reading::pending("pi", 0.0, 0.0, 0.0, ts);
        assert_eq!(r.captured_at.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(r.captured_at_us(), 1_700_000_000_123_456);
    }

    #[test]
    fn status_display_matches_storage_encoding() {
        assert_eq!(ReadingStatus::Pending.to_string(), "pending");
        assert_eq!(ReadingStatus::Sent.to_string(), "sent");
    }
}
