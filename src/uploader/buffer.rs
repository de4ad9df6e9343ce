//! Bounded record buffer between the recorders and the uploader task

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::collector::stats::{add, incr, Counters};
use crate::config::OverflowPolicy;
use crate::error::MetricsError;
use crate::record::Envelope;

/// Destination for records handed off by the aggregator
pub trait RecordSink: Send + Sync + std::fmt::Debug {
    /// Accept closed records in delivery order; never blocks beyond the
    /// configured overflow bound
    fn push_records(&self, records: Vec<Envelope>);
}

/// Buffer settings
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    pub flush_at: usize,
    pub overflow_policy: OverflowPolicy,
    pub block_timeout: Duration,
}

impl From<&crate::config::MetricsConfig> for BufferConfig {
    fn from(config: &crate::config::MetricsConfig) -> Self {
        Self {
            capacity: config.buffer_capacity.max(1),
            flush_at: config.flush_at.max(1),
            overflow_policy: config.overflow_policy,
            block_timeout: config.block_timeout,
        }
    }
}

/// FIFO of envelopes awaiting transmission
///
/// Producers push under a single short lock. Crossing `flush_at` wakes the
/// uploader through `flush_notifier`.
#[derive(Debug)]
pub struct BatchBuffer {
    config: BufferConfig,
    queue: Mutex<VecDeque<Envelope>>,
    not_full: Condvar,
    flush_notifier: Arc<Notify>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl BatchBuffer {
    pub fn new(config: BufferConfig, counters: Arc<Counters>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            config,
            not_full: Condvar::new(),
            flush_notifier: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    /// Notifier signalled when the buffer reaches `flush_at`
    pub fn flush_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.flush_notifier)
    }

    pub fn flush_at(&self) -> usize {
        self.config.flush_at
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting records; later pushes count as dropped at shutdown
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_full.notify_all();
    }

    /// Append one record
    ///
    /// Returns `BufferOverflow` when a record was lost to make room. The
    /// buffer is never left over capacity.
    pub fn push(&self, envelope: Envelope) -> Result<(), MetricsError> {
        self.push_until(envelope, Instant::now() + self.config.block_timeout)
    }

    /// Append one record, waiting for room no later than `deadline` under
    /// [`OverflowPolicy::Block`]
    ///
    /// When no room appears in time the oldest record is evicted, the same
    /// as [`OverflowPolicy::DropOldest`].
    pub fn push_until(&self, envelope: Envelope, deadline: Instant) -> Result<(), MetricsError> {
        if self.is_closed() {
            incr(&self.counters.records_dropped_shutdown);
            return Err(MetricsError::BufferOverflow { dropped: 1 });
        }

        let mut queue = self.queue.lock();
        let mut result = Ok(());

        if queue.len() >= self.config.capacity {
            if self.config.overflow_policy == OverflowPolicy::Block {
                self.wait_for_room(&mut queue, deadline);
            }
            if self.is_closed() {
                drop(queue);
                incr(&self.counters.records_dropped_shutdown);
                return Err(MetricsError::BufferOverflow { dropped: 1 });
            }
            if queue.len() >= self.config.capacity {
                queue.pop_front();
                result = Err(self.overflowed());
            }
        }

        queue.push_back(envelope);
        incr(&self.counters.records_enqueued);
        let reached = queue.len() >= self.config.flush_at;
        drop(queue);

        if reached {
            self.flush_notifier.notify_one();
        }
        result
    }

    fn wait_for_room(&self, queue: &mut MutexGuard<'_, VecDeque<Envelope>>, deadline: Instant) {
        if Instant::now() >= deadline {
            return;
        }
        let capacity = self.config.capacity;
        let mut wait = || {
            let _ = self.not_full.wait_while_until(
                queue,
                |q| q.len() >= capacity && !self.is_closed(),
                deadline,
            );
        };

        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            // the uploader runs on this same thread and cannot drain while we wait
            Ok(RuntimeFlavor::CurrentThread) => {}
            Ok(_) => tokio::task::block_in_place(wait),
            Err(_) => wait(),
        }
    }

    fn overflowed(&self) -> MetricsError {
        let dropped = incr(&self.counters.records_dropped_overflow);
        // Sustained overflow would flood the log; report at powers of two
        if dropped.is_power_of_two() {
            warn!(
                dropped_total = dropped,
                capacity = self.config.capacity,
                "Metrics buffer full, dropping records"
            );
        }
        MetricsError::BufferOverflow { dropped: 1 }
    }

    /// Take up to `max` records from the front
    pub fn drain_batch(&self, max: usize) -> Vec<Envelope> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        let batch: Vec<Envelope> = queue.drain(..n).collect();
        drop(queue);

        if !batch.is_empty() {
            self.not_full.notify_all();
        }
        batch
    }

    /// Take everything
    pub fn drain_all(&self) -> Vec<Envelope> {
        let batch: Vec<Envelope> = self.queue.lock().drain(..).collect();
        self.not_full.notify_all();
        batch
    }

    /// Count records still buffered as lost at shutdown and discard them
    pub fn discard_remaining(&self) -> u64 {
        let remaining = self.drain_all().len() as u64;
        if remaining > 0 {
            add(&self.counters.records_dropped_shutdown, remaining);
        }
        remaining
    }
}

impl RecordSink for BatchBuffer {
    fn push_records(&self, records: Vec<Envelope>) {
        let total = records.len();
        let deadline = Instant::now() + self.config.block_timeout;
        let mut dropped = 0usize;
        for envelope in records {
            if self.push_until(envelope, deadline).is_err() {
                dropped += 1;
            }
        }
        debug!(records = total, dropped, "Records handed to uploader");
    }
}
