use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::db::models::{Reading, ReadingStatus};

/// Row id assigned by the queue on append.
pub type RecordId = i64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("reading already queued for device {device_id} at {captured_at}")]
    Duplicate {
        device_id: String,
        captured_at: DateTime<Utc>,
    },

    #[error("no reading queued for device {device_id} at {captured_at}")]
    NotFound {
        device_id: String,
        captured_at: DateTime<Utc>,
    },

    /// Disk full, corruption, lost file handle. Never retried silently.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Counters exposed on the status API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub sent: i64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// Durable store-and-forward queue of readings backed by the `readings` table.
///
/// Every method is a single SQL statement, so each one is atomic with respect
/// to the others and is committed before it returns. Cloning is cheap and all
/// clones share the same pool.
#[derive(Debug, Clone)]
pub struct ReadingQueue {
    pool: SqlitePool,
}

impl ReadingQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert `reading` as a new pending record.
    ///
    /// The status carried by `reading` is ignored: records always enter the
    /// queue as `pending`. A colliding `(device_id, captured_at)` key leaves the
    /// table untouched and yields [`QueueError::Duplicate`].
    pub async fn append(&self, reading: &Reading) -> Result<RecordId, QueueError> {
        let result = sqlx::query(
            r#"
            INSERT INTO readings
                (device_id, temperature, humidity, pressure, captured_at_us, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.pressure)
        .bind(reading.captured_at_us())
        .bind(ReadingStatus::Pending)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(QueueError::Duplicate {
                    device_id: reading.device_id.clone(),
                    captured_at: reading.captured_at,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All pending readings, oldest capture first.
    pub async fn list_pending(&self) -> Result<Vec<Reading>, QueueError> {
        self.pending_page(None).await
    }

    /// At most `limit` pending readings, oldest capture first.
    pub async fn list_pending_limited(&self, limit: u32) -> Result<Vec<Reading>, QueueError> {
        self.pending_page(Some(limit)).await
    }

    async fn pending_page(&self, limit: Option<u32>) -> Result<Vec<Reading>, QueueError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT device_id, temperature, humidity, pressure,
                   captured_at_us, status, last_error
            FROM readings
            WHERE status = ?1
            ORDER BY captured_at_us ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(ReadingStatus::Pending)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Transition a reading to `sent` and clear its `last_error`.
    ///
    /// Marking an already-sent reading again is a no-op.
    pub async fn mark_sent(
        &self,
        device_id: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE readings
            SET status = ?1, last_error = NULL
            WHERE device_id = ?2 AND captured_at_us = ?3
            "#,
        )
        .bind(ReadingStatus::Sent)
        .bind(device_id)
        .bind(captured_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(QueueError::NotFound {
                device_id: device_id.to_owned(),
                captured_at,
            });
        }
        Ok(())
    }

    /// Record the error of a failed delivery attempt. The reading stays
    /// pending; a reading that is already sent is left alone.
    pub async fn mark_failed(
        &self,
        device_id: &str,
        captured_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        // Matching on the key alone keeps NotFound detection in this statement.
        let done = sqlx::query(
            r#"
            UPDATE readings
            SET last_error = CASE WHEN status = ?4 THEN ?1 ELSE last_error END
            WHERE device_id = ?2 AND captured_at_us = ?3
            "#,
        )
        .bind(error)
        .bind(device_id)
        .bind(captured_at.timestamp_micros())
        .bind(ReadingStatus::Pending)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(QueueError::NotFound {
                device_id: device_id.to_owned(),
                captured_at,
            });
        }
        Ok(())
    }

    /// Look up a single reading by its natural key, whatever its status.
    pub async fn get(
        &self,
        device_id: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Option<Reading>, QueueError> {
        let row = sqlx::query_as::<_, Reading>(
            r#"
            SELECT device_id, temperature, humidity, pressure,
                   captured_at_us, status, last_error
            FROM readings
            WHERE device_id = ?1 AND captured_at_us = ?2
            "#,
        )
        .bind(device_id)
        .bind(captured_at.timestamp_micros())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// The most recently captured reading across all devices, sent or not.
    pub async fn latest(&self) -> Result<Option<Reading>, QueueError> {
        let row = sqlx::query_as::<_, Reading>(
            r#"
            SELECT device_id, temperature, humidity, pressure,
                   captured_at_us, status, last_error
            FROM readings
            ORDER BY captured_at_us DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Newest capture timestamp queued for `device_id`, if any.
    pub async fn last_captured_at(
        &self,
        device_id: &str,
    ) -> Result<Option<DateTime<Utc>>, QueueError> {
        let us: Option<i64> =
            sqlx::query_scalar("SELECT MAX(captured_at_us) FROM readings WHERE device_id = ?1")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(us.and_then(DateTime::<Utc>::from_timestamp_micros))
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, sent, oldest_us): (i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END), 0),
                MIN(CASE WHEN status = 'pending' THEN captured_at_us END)
            FROM readings
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending,
            sent,
            oldest_pending: oldest_us.and_then(DateTime::<Utc>::from_timestamp_micros),
        })
    }
}
