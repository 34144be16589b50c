use std::time::Duration;

use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::db::{
    models::Reading,
    queue::{QueueError, ReadingQueue},
};

use super::{DeliveryClient, DeliveryError};

/// Outcome counters for one drain of the pending set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub sent: usize,
    pub transient: usize,
    pub fatal: usize,
    /// The pass stopped early because shutdown was requested.
    pub interrupted: bool,
}

/// Drains pending readings to the remote endpoint on a fixed period.
///
/// Each tick snapshots the pending set and attempts every record once,
/// oldest first. Failures are recorded on the row and retried on a later tick;
/// there is no backoff and no dead-lettering, so a reading rejected for a
/// fatal reason stays pending until an operator fixes the cause.
///
/// Passes never overlap: the pass runs inline in the tick loop and ticks that
/// fall due while it is still draining are skipped.
pub struct RelayScheduler<C> {
    queue: ReadingQueue,
    client: C,
    period: Duration,
}

impl<C: DeliveryClient> RelayScheduler<C> {
    pub fn new(queue: ReadingQueue, client: C, period: Duration) -> Self {
        Self {
            queue,
            client,
            period,
        }
    }

    /// Tick until `shutdown` fires, then close the client.
    ///
    /// A storage error aborts the loop and is returned to the caller.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(period_ms = self.period.as_millis() as u64, "Relay scheduler started");
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.drain(Some(&shutdown)).await {
                        error!(error = %e, "Relay pass aborted by storage failure");
                        break Err(e);
                    }
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        self.client.close().await;
        info!("Relay scheduler stopped");
        result
    }

    /// Run a single drain pass to completion.
    pub async fn run_pass(&mut self) -> Result<PassReport, QueueError> {
        self.drain(None).await
    }

    async fn drain(
        &mut self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<PassReport, QueueError> {
        let pending = self.queue.list_pending().await?;
        let mut report = PassReport::default();

        for reading in &pending {
            if shutdown.is_some_and(|s| *s.borrow()) {
                report.interrupted = true;
                break;
            }

            report.attempted += 1;
            match self.client.deliver(reading).await {
                Ok(()) => {
                    self.record_sent(reading).await?;
                    report.sent += 1;
                }
                Err(e @ DeliveryError::Transient(_)) => {
                    warn!(
                        device_id = %reading.device_id,
                        captured_at = %reading.captured_at,
                        error = %e,
                        "Delivery failed; will retry next tick"
                    );
                    self.record_failure(reading, &e).await?;
                    report.transient += 1;
                }
                Err(e @ DeliveryError::Fatal(_)) => {
                    error!(
                        alert = true,
                        device_id = %reading.device_id,
                        captured_at = %reading.captured_at,
                        error = %e,
                        "Delivery rejected permanently; reading stays pending until the cause is fixed"
                    );
                    self.record_failure(reading, &e).await?;
                    report.fatal += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                sent = report.sent,
                transient = report.transient,
                fatal = report.fatal,
                interrupted = report.interrupted,
                "Relay pass finished"
            );
        } else {
            debug!("Relay pass found nothing pending");
        }
        Ok(report)
    }

    async fn record_sent(&self, reading: &Reading) -> Result<(), QueueError> {
        match self
            .queue
            .mark_sent(&reading.device_id, reading.captured_at)
            .await
        {
            Err(QueueError::NotFound { .. }) => {
                warn!(device_id = %reading.device_id, captured_at = %reading.captured_at, "Delivered reading vanished from the queue");
                Ok(())
            }
            other => other,
        }
    }

    async fn record_failure(&self, reading: &Reading, e: &DeliveryError) -> Result<(), QueueError> {
        match self
            .queue
            .mark_failed(&reading.device_id, reading.captured_at, &e.to_string())
            .await
        {
            Err(QueueError::NotFound { .. }) => {
                warn!(device_id = %reading.device_id, captured_at = %reading.captured_at, "Failed reading vanished from the queue");
                Ok(())
            }
            other => other,
        }
    }
}
