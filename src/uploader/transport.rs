//! Backend transport trait and in-process implementations
//!
//! The uploader talks to the backend only through [`Transport`]. The HTTP
//! ingestion client lives in [`super::http`]; this module holds the trait,
//! its error type and two transports that never leave the process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::record::Envelope;

/// Error during batch transmission
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransmissionError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Network error during transmission
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Rate limited by the backend
    #[error("Rate limited")]
    RateLimited,

    /// Request timeout
    #[error("Transmission timeout after {0:?}")]
    Timeout(Duration),

    /// Backend returned an error
    #[error("Backend error: {status_code} - {message}")]
    Backend { status_code: u16, message: String },
}

impl TransmissionError {
    /// Whether another attempt could succeed
    ///
    /// Bad credentials and unserializable batches fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransmissionError::Auth(_) | TransmissionError::Serialization(_)
        )
    }
}

/// Trait for delivering record batches to an observability backend
///
/// Implementations must not panic on failure; the uploader retries
/// retryable errors and drops the batch otherwise.
///
/// # Example
///
/// ```rust
/// use convo_metrics::record::Envelope;
/// use convo_metrics::uploader::{Transport, TransmissionError};
///
/// #[derive(Debug)]
/// struct StdoutTransport;
///
/// #[async_trait::async_trait]
/// impl Transport for StdoutTransport {
///     async fn send_batch(&self, batch: &[Envelope]) -> Result<(), TransmissionError> {
///         for envelope in batch {
///             println!("{} {}", envelope.record.kind(), envelope.session_id());
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver one batch; batch size never exceeds `flush_at`
    async fn send_batch(&self, batch: &[Envelope]) -> Result<(), TransmissionError>;

    /// Release resources after the final flush
    async fn shutdown(&self) -> Result<(), TransmissionError> {
        Ok(())
    }

    /// Short name for logs
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Transport that discards every batch
#[derive(Debug, Clone, Default)]
pub struct NoOpTransport;

#[async_trait]
impl Transport for NoOpTransport {
    async fn send_batch(&self, _batch: &[Envelope]) -> Result<(), TransmissionError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Transport that keeps every delivered batch in memory
///
/// Useful for tests and for embedding hosts that forward records themselves.
/// It can be told to fail the next N attempts.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    batches: Mutex<Vec<Vec<Envelope>>>,
    failures_left: AtomicU32,
    failure: Mutex<Option<TransmissionError>>,
    attempts: AtomicU32,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` attempts with a network error
    pub fn fail_next(&self, n: u32) {
        self.fail_next_with(n, TransmissionError::Network("injected failure".to_string()));
    }

    /// Fail the next `n` attempts with `error`
    pub fn fail_next_with(&self, n: u32, error: TransmissionError) {
        *self.failure.lock() = Some(error);
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Every successfully delivered batch, in delivery order
    pub fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().clone()
    }

    /// Every delivered record, flattened
    pub fn records(&self) -> Vec<Envelope> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Attempts made, including failed ones
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_batch(&self, batch: &[Envelope]) -> Result<(), TransmissionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            let error = self
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| TransmissionError::Network("injected failure".to_string()));
            return Err(error);
        }

        self.batches.lock().push(batch.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
