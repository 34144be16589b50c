pub mod decoder;
pub mod mqtt;
pub mod service;

use std::future::Future;

use tokio::sync::mpsc;

pub use service::IngestionListener;

/// Source of raw sensor payloads.
///
/// Implementations hide subscription and reconnect handling; the listener only
/// ever asks for the next payload.
pub trait Feed {
    /// Wait for the next payload. `None` means the feed is closed for good.
    fn recv(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;
}

impl Feed for mpsc::Receiver<Vec<u8>> {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        mpsc::Receiver::recv(self).await
    }
}
