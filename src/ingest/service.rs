use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::{
    models::truncate_to_micros,
    queue::{QueueError, ReadingQueue, RecordId},
};

use super::{decoder, Feed};

/// Turns feed payloads into pending queue records.
///
/// Capture timestamps are kept strictly increasing for the configured device:
/// when the wall clock has not moved past the last queued reading (two messages
/// in the same microsecond, or the clock stepping backwards) the new reading is
/// stamped one microsecond after its predecessor.
pub struct IngestionListener {
    queue: ReadingQueue,
    device_id: String,
    last_captured_at: Option<DateTime<Utc>>,
}

impl IngestionListener {
    /// Seeds the timestamp floor from what is already queued so a restart
    /// with a lagging clock cannot collide with earlier readings.
    pub async fn new(queue: ReadingQueue, device_id: impl Into<String>) -> Result<Self, QueueError> {
        let device_id = device_id.into();
        let last_captured_at = queue.last_captured_at(&device_id).await?;
        Ok(Self {
            queue,
            device_id,
            last_captured_at,
        })
    }

    /// Consume `feed` until it closes or `shutdown` fires.
    ///
    /// Only storage failures end the loop early; they are returned so the
    /// process can stop instead of silently dropping readings.
    pub async fn run<F: Feed>(
        mut self,
        mut feed: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        info!(device_id = %self.device_id, "Ingestion listener started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Ingestion listener stopping");
                    break;
                }
                payload = feed.recv() => match payload {
                    Some(payload) => {
                        self.handle_payload(&payload).await?;
                    }
                    None => {
                        warn!("Feed closed; ingestion listener stopping");
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    pub async fn handle_payload(&mut self, payload: &[u8]) -> Result<Option<RecordId>, QueueError> {
        self.handle_payload_at(payload, Utc::now()).await
    }

    /// Decode and queue one payload received at `now`.
    ///
    /// Returns `Ok(None)` when the payload is dropped: undecodable, or its key
    /// already exists in the queue.
    pub async fn handle_payload_at(
        &mut self,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<RecordId>, QueueError> {
        let captured_at = self.next_captured_at(now);

        let reading = match decoder::decode(payload, &self.device_id, captured_at) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Dropping undecodable payload"
                );
                return Ok(None);
            }
        };

        match self.queue.append(&reading).await {
            Ok(id) => {
                self.last_captured_at = Some(reading.captured_at);
                debug!(
                    id,
                    device_id = %reading.device_id,
                    temperature = reading.temperature,
                    humidity = reading.humidity,
                    pressure = reading.pressure,
                    captured_at = %reading.captured_at,
                    "Reading queued as pending"
                );
                Ok(Some(id))
            }
            Err(QueueError::Duplicate {
                device_id,
                captured_at,
            }) => {
                // Later readings must not be keyed onto the taken slot again.
                self.last_captured_at = Some(captured_at);
                warn!(device_id = %device_id, captured_at = %captured_at, "Dropping duplicate reading");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn next_captured_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = truncate_to_micros(now);
        match self.last_captured_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::{in_memory_pool, models::Reading};

    const PAYLOAD: &[u8] = br#"{"Temperature": 21.0, "Humidity": 50.0, "Pressure": 1013.0}"#;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn listener() -> (IngestionListener, ReadingQueue) {
        let queue = ReadingQueue::new(in_memory_pool().await);
        let l = IngestionListener::new(queue.clone(), "pi").await.unwrap();
        (l, queue)
    }

    #[tokio::test]
    async fn valid_payload_is_queued_pending() {
        let (mut l, queue) = listener().await;
        let id = l.handle_payload_at(PAYLOAD, at(10)).await.unwrap();
        assert!(id.is_some());

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending, vec![Reading::pending("pi", 21.0, 50.0, 1013.0, at(10))]);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_not_queued() {
        let (mut l, queue) = listener().await;
        assert!(l.handle_payload_at(b"{oops", at(10)).await.unwrap().is_none());
        assert!(l
            .handle_payload_at(br#"{"Temperature": 1}"#, at(11))
            .await
            .unwrap()
            .is_none());
        assert!(queue.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_instant_readings_get_distinct_increasing_timestamps() {
        let (mut l, queue) = listener().await;
        l.handle_payload_at(PAYLOAD, at(10)).await.unwrap();
        l.handle_payload_at(PAYLOAD, at(10)).await.unwrap();
        l.handle_payload_at(PAYLOAD, at(9)).await.unwrap();

        let stamps: Vec<_> = queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.captured_at)
            .collect();
        assert_eq!(
            stamps,
            vec![
                at(10),
                at(10) + Duration::microseconds(1),
                at(10) + Duration::microseconds(2),
            ]
        );
    }

    #[tokio::test]
    async fn restart_continues_after_the_newest_queued_timestamp() {
        let queue = ReadingQueue::new(in_memory_pool().await);
        queue
            .append(&Reading::pending("pi", 1.0, 1.0, 1.0, at(100)))
            .await
            .unwrap();

        let mut l = IngestionListener::new(queue.clone(), "pi").await.unwrap();
        l.handle_payload_at(PAYLOAD, at(50)).await.unwrap();

        let newest = queue.latest().await.unwrap().unwrap();
        assert_eq!(newest.captured_at, at(100) + Duration::microseconds(1));
    }

    #[tokio::test]
    async fn collision_with_foreign_writer_is_dropped() {
        let (mut l, queue) = listener().await;
        // Another writer claims the key after the listener was seeded.
        queue
            .append(&Reading::pending("pi", 1.0, 1.0, 1.0, at(10)))
            .await
            .unwrap();

        let id = l.handle_payload_at(PAYLOAD, at(10)).await.unwrap();
        assert!(id.is_none());

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].temperature, 1.0);
    }

    #[tokio::test]
    async fn collision_moves_later_readings_past_the_taken_key() {
        let (mut l, queue) = listener().await;
        l.handle_payload_at(PAYLOAD, at(10)).await.unwrap();
        let taken = at(10) + Duration::microseconds(1);
        queue
            .append(&Reading::pending("pi", 1.0, 1.0, 1.0, taken))
            .await
            .unwrap();

        // The clock stalls: every payload arrives at the same instant.
        assert!(l.handle_payload_at(PAYLOAD, at(10)).await.unwrap().is_none());
        assert!(l.handle_payload_at(PAYLOAD, at(10)).await.unwrap().is_some());
        assert!(l.handle_payload_at(PAYLOAD, at(10)).await.unwrap().is_some());

        let stamps: Vec<_> = queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.captured_at)
            .collect();
        assert_eq!(
            stamps,
            vec![
                at(10),
                taken,
                at(10) + Duration::microseconds(2),
                at(10) + Duration::microseconds(3),
            ]
        );
    }

    #[tokio::test]
    async fn run_drains_feed_until_closed() {
        let (l, queue) = listener().await;
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(PAYLOAD.to_vec()).await.unwrap();
        tx.send(b"garbage".to_vec()).await.unwrap();
        tx.send(PAYLOAD.to_vec()).await.unwrap();
        drop(tx);

        l.run(rx, shutdown_rx).await.unwrap();
        assert_eq!(queue.list_pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (l, _queue) = listener().await;
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(l.run(rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
