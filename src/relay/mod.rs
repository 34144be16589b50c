pub mod service;

use std::future::Future;

use thiserror::Error;

use crate::db::models::Reading;

pub use service::{PassReport, RelayScheduler};

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection missing, dropped, timed out, cancelled, or throttled.
    /// The reading is retried on the next tick.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Credentials rejected or the endpoint refused the document itself.
    /// Retrying cannot help until an operator intervenes.
    #[error("fatal delivery failure: {0}")]
    Fatal(String),
}

impl DeliveryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::Fatal(_))
    }
}

/// A connection to the remote ingestion endpoint.
///
/// Implementations own exactly one logical connection, open it lazily on the
/// first delivery and rebuild it after a drop. They are driven by a single
/// relay pass at a time and need no internal locking.
pub trait DeliveryClient {
    fn deliver(&mut self, reading: &Reading) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Release the connection. The next `deliver` reconnects.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
