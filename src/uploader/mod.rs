//! Batch uploader
//!
//! The uploader decouples the rate at which records are produced from the rate
//! at which they are transmitted. Recorders push closed records into a bounded
//! [`BatchBuffer`]; a single background task drains it in batches of at most
//! `flush_at` records and hands each batch to a [`Transport`].
//!
//! A flush happens on whichever comes first:
//!
//! - the buffer reaches `flush_at` records
//! - `flush_interval` has elapsed since the last flush
//! - the collector is shutting down
//!
//! Failed batches are retried with bounded exponential backoff and then
//! dropped. Nothing in this module ever blocks a recorder on network I/O.

pub mod buffer;
pub mod http;
pub mod ingestion;
pub mod transport;

pub use buffer::{BatchBuffer, BufferConfig, RecordSink};
pub use http::HttpTransport;
pub use transport::{InMemoryTransport, NoOpTransport, TransmissionError, Transport};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::stats::{add, incr, Counters};
use crate::error::{MetricsError, RetryConfig};
use crate::record::Envelope;

/// Uploader timing and retry settings
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub flush_at: usize,
    pub flush_interval: Duration,
    pub retry: RetryConfig,
}

impl From<&crate::config::MetricsConfig> for UploaderConfig {
    fn from(config: &crate::config::MetricsConfig) -> Self {
        Self {
            flush_at: config.flush_at.max(1),
            flush_interval: config.flush_interval,
            retry: config.retry.clone(),
        }
    }
}

/// Outcome of [`Uploader::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// The final flush finished inside the time bound
    pub drained: bool,
    /// Records abandoned because the bound expired
    pub dropped: u64,
}

#[derive(Debug)]
struct Shared {
    buffer: Arc<BatchBuffer>,
    transport: Arc<dyn Transport>,
    config: UploaderConfig,
    counters: Arc<Counters>,
    /// Serializes drain-and-send so batches leave in buffer order
    send_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicU64,
}

/// Handle to the background upload task
#[derive(Debug)]
pub struct Uploader {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Uploader {
    /// Spawn the upload task on the current Tokio runtime
    pub fn spawn(
        buffer: Arc<BatchBuffer>,
        transport: Arc<dyn Transport>,
        config: UploaderConfig,
        counters: Arc<Counters>,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer,
            transport,
            config,
            counters,
            send_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(Arc::clone(&shared), cancel.clone()));
        debug!(
            transport = shared.transport.name(),
            flush_at = shared.config.flush_at,
            flush_interval_ms = shared.config.flush_interval.as_millis() as u64,
            "Uploader task started"
        );

        Self {
            shared,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.shared.buffer
    }

    /// Wake the upload task without waiting for it
    pub fn request_flush(&self) {
        self.shared.buffer.flush_notifier().notify_one();
    }

    /// Transmit everything buffered right now and wait for the result
    ///
    /// Returns the number of records delivered.
    pub async fn flush(&self) -> usize {
        flush_pending(&self.shared).await
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting records, perform a final flush and stop the task
    ///
    /// Waits at most `timeout`; whatever is still unsent after that is
    /// counted as dropped and the task is aborted.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.shared.buffer.close();
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return ShutdownReport {
                drained: true,
                dropped: 0,
            };
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                let dropped = self.shared.buffer.discard_remaining();
                info!(dropped, "Uploader drained");
                ShutdownReport {
                    drained: dropped == 0,
                    dropped,
                }
            }
            Err(_) => {
                handle.abort();
                let in_flight = self.shared.in_flight.swap(0, Ordering::SeqCst);
                if in_flight > 0 {
                    add(&self.shared.counters.records_dropped_shutdown, in_flight);
                }
                let dropped = in_flight + self.shared.buffer.discard_remaining();
                warn!(
                    dropped,
                    timeout_ms = timeout.as_millis() as u64,
                    "Uploader drain timed out, dropping unsent records"
                );
                ShutdownReport {
                    drained: false,
                    dropped,
                }
            }
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let notifier = shared.buffer.flush_notifier();
    let mut deadline = Instant::now() + shared.config.flush_interval;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = notifier.notified() => {
                // size threshold or explicit request
            }
            _ = tokio::time::sleep_until(deadline) => {
                // interval elapsed
            }
        }

        flush_pending(&shared).await;
        deadline = Instant::now() + shared.config.flush_interval;
    }

    let sent = flush_pending(&shared).await;
    debug!(sent, "Final flush complete");

    if let Err(e) = shared.transport.shutdown().await {
        warn!(error = %e, "Transport shutdown failed");
    }
}

/// Drain the buffer in `flush_at`-sized batches and send each in order
async fn flush_pending(shared: &Shared) -> usize {
    let _guard = shared.send_lock.lock().await;
    let mut delivered = 0;

    loop {
        let batch = shared.buffer.drain_batch(shared.config.flush_at);
        if batch.is_empty() {
            break;
        }

        let size = batch.len() as u64;
        shared.in_flight.store(size, Ordering::SeqCst);
        if send_with_retry(shared, &batch).await.is_ok() {
            delivered += batch.len();
        }
        shared.in_flight.store(0, Ordering::SeqCst);
    }

    delivered
}

async fn send_with_retry(shared: &Shared, batch: &[Envelope]) -> Result<(), MetricsError> {
    let retry = &shared.config.retry;
    let mut last_error = None;
    let mut attempts = 0;

    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            incr(&shared.counters.transmission_retries);
            tokio::time::sleep(retry.delay_for(attempt)).await;
        }
        attempts += 1;

        match shared.transport.send_batch(batch).await {
            Ok(()) => {
                incr(&shared.counters.batches_sent);
                add(&shared.counters.records_sent, batch.len() as u64);
                debug!(batch_size = batch.len(), attempt = attempt + 1, "Batch sent");
                return Ok(());
            }
            Err(e) => {
                warn!(
                    batch_size = batch.len(),
                    attempt = attempt + 1,
                    error = %e,
                    "Batch transmission failed"
                );
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable {
                    break;
                }
            }
        }
    }

    incr(&shared.counters.batches_dropped);
    add(
        &shared.counters.records_dropped_transmission,
        batch.len() as u64,
    );

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "Unknown error".to_string());
    error!(
        batch_size = batch.len(),
        attempts,
        error = %message,
        "Dropping batch after failed transmission"
    );
    Err(MetricsError::transmission_failure(attempts, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::record::{Metadata, Record, Span};

    fn envelope(name: &str) -> Envelope {
        Envelope::new(Record::Span(Span::open("s", name, None, Metadata::new())))
    }

    fn setup(
        flush_at: usize,
        flush_interval: Duration,
        retry: RetryConfig,
    ) -> (Uploader, Arc<InMemoryTransport>, Arc<Counters>) {
        let counters = Arc::new(Counters::new());
        let buffer = Arc::new(BatchBuffer::new(
            BufferConfig {
                capacity: 100,
                flush_at,
                overflow_policy: OverflowPolicy::DropOldest,
                block_timeout: Duration::from_millis(10),
            },
            Arc::clone(&counters),
        ));
        let transport = Arc::new(InMemoryTransport::new());
        let uploader = Uploader::spawn(
            buffer,
            transport.clone(),
            UploaderConfig {
                flush_at,
                flush_interval,
                retry,
            },
            Arc::clone(&counters),
        );
        (uploader, transport, counters)
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 40,
            exponential_backoff: true,
            jitter_factor: 0.0,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_before_interval() {
        let (uploader, transport, _) = setup(3, Duration::from_secs(3600), fast_retry(0));
        for i in 0..3 {
            uploader.buffer().push(envelope(&i.to_string())).unwrap();
        }
        settle().await;

        assert_eq!(transport.batch_count(), 1);
        assert_eq!(transport.batches()[0].len(), 3);
        uploader.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_trigger_flushes_partial_batch() {
        let (uploader, transport, _) = setup(10, Duration::from_millis(500), fast_retry(0));
        uploader.buffer().push(envelope("lonely")).unwrap();
        settle().await;
        assert_eq!(transport.batch_count(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(transport.batch_count(), 1);
        uploader.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_batches_never_exceed_flush_at() {
        let (uploader, transport, _) = setup(4, Duration::from_secs(3600), fast_retry(0));
        for i in 0..10 {
            uploader.buffer().push(envelope(&i.to_string())).unwrap();
        }
        let report = uploader.shutdown(Duration::from_secs(5)).await;
        assert!(report.drained);

        let sizes: Vec<usize> = transport.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|&n| n <= 4));
    }

    #[tokio::test]
    async fn test_batches_preserve_push_order() {
        let (uploader, transport, _) = setup(3, Duration::from_secs(3600), fast_retry(0));
        for i in 0..7 {
            uploader.buffer().push(envelope(&i.to_string())).unwrap();
        }
        uploader.flush().await;
        uploader.shutdown(Duration::from_secs(5)).await;

        let names: Vec<String> = transport
            .records()
            .iter()
            .map(|e| match &e.record {
                Record::Span(span) => span.name.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(names, vec!["0", "1", "2", "3", "4", "5", "6"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let (uploader, transport, counters) = setup(1, Duration::from_secs(3600), fast_retry(3));
        transport.fail_next(2);

        uploader.buffer().push(envelope("retried")).unwrap();
        // waits for the worker's in-progress send; paused time skips the backoff
        uploader.flush().await;

        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.batch_count(), 1);
        let stats = counters.stats(0);
        assert_eq!(stats.transmission_retries, 2);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.batches_dropped, 0);
        uploader.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_dropped_after_retry_cap() {
        let (uploader, transport, counters) = setup(2, Duration::from_secs(3600), fast_retry(2));
        transport.fail_next(10);

        uploader.buffer().push(envelope("a")).unwrap();
        uploader.buffer().push(envelope("b")).unwrap();
        uploader.flush().await;

        assert_eq!(transport.attempts(), 3);
        let stats = counters.stats(0);
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.records_dropped_transmission, 2);
        uploader.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let (uploader, transport, counters) = setup(1, Duration::from_secs(3600), fast_retry(3));
        transport.fail_next_with(5, TransmissionError::Auth("bad key".into()));

        uploader.buffer().push(envelope("denied")).unwrap();
        uploader.flush().await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(counters.stats(0).batches_dropped, 1);
        uploader.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let (uploader, transport, _) = setup(100, Duration::from_secs(3600), fast_retry(0));
        uploader.buffer().push(envelope("last")).unwrap();

        let report = uploader.shutdown(Duration::from_secs(5)).await;
        assert_eq!(
            report,
            ShutdownReport {
                drained: true,
                dropped: 0
            }
        );
        assert_eq!(transport.records().len(), 1);
        assert!(!uploader.is_running());
        assert!(uploader.buffer().push(envelope("late")).is_err());
    }
}
