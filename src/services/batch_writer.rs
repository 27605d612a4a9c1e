//! Buffered, retrying writer between the poll loops and the time-series sink.
//!
//! Poll loops enqueue through a cloneable [`WriterHandle`] that never waits on the sink.
//! A single background task flushes when `batch_size` readings are queued or when
//! `flush_interval` passes. A batch stays counted against the buffer cap while in flight
//! and goes back to the front of the queue if every attempt fails, so nothing is removed
//! until the sink acknowledged it.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

use crate::config::WriterConfig;
use crate::devices::DeviceReading;
use crate::storage::TimeSeriesSink;
use crate::utils::error::SinkError;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Buffer was full; the oldest queued reading was discarded to make room
    DroppedOldest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub enqueued: u64,
    pub written: u64,
    pub dropped: u64,
    pub failed_flushes: u64,
    pub batches_written: u64,
    pub buffered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    failed_flushes: AtomicU64,
    batches_written: AtomicU64,
}

#[derive(Debug, Default)]
struct Buffer {
    queue: VecDeque<DeviceReading>,
    in_flight: usize,
}

impl Buffer {
    fn total(&self) -> usize {
        self.queue.len() + self.in_flight
    }
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<Buffer>,
    wake: Notify,
    batch_size: usize,
    max_buffer_size: usize,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_batch(&self) -> Vec<DeviceReading> {
        let mut buffer = self.lock();
        let n = buffer.queue.len().min(self.batch_size);
        buffer.in_flight += n;
        buffer.queue.drain(..n).collect()
    }

    fn acknowledge(&self, count: usize) {
        let mut buffer = self.lock();
        buffer.in_flight = buffer.in_flight.saturating_sub(count);
    }

    fn requeue(&self, batch: Vec<DeviceReading>) {
        let mut buffer = self.lock();
        buffer.in_flight = buffer.in_flight.saturating_sub(batch.len());
        for reading in batch.into_iter().rev() {
            buffer.queue.push_front(reading);
        }
    }

    fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

/// Producer side of the writer, shared by every poll loop.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    shared: Arc<Shared>,
}

impl WriterHandle {
    /// Add a reading without waiting. When the buffer is at its cap the oldest queued
    /// reading is dropped and counted.
    pub fn enqueue(&self, reading: DeviceReading) -> EnqueueOutcome {
        let shared = &self.shared;
        shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        let (outcome, queued) = {
            let mut buffer = shared.lock();
            // The cap exceeds batch_size, so at the cap the queue is never empty
            let outcome = if buffer.total() < shared.max_buffer_size {
                EnqueueOutcome::Queued
            } else {
                buffer.queue.pop_front();
                EnqueueOutcome::DroppedOldest
            };
            buffer.queue.push_back(reading);
            (outcome, buffer.queue.len())
        };

        if outcome != EnqueueOutcome::Queued {
            let dropped = shared.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                error!(
                    "❌ Writer buffer full ({} readings), data lost: {} reading(s) dropped so far",
                    shared.max_buffer_size, dropped
                );
            }
        }

        if queued >= shared.batch_size {
            shared.wake.notify_one();
        }
        outcome
    }

    pub fn enqueue_all<I: IntoIterator<Item = DeviceReading>>(&self, readings: I) {
        for reading in readings {
            self.enqueue(reading);
        }
    }

    /// Readings queued or in flight.
    pub fn buffered(&self) -> usize {
        self.shared.lock().total()
    }

    pub fn stats(&self) -> WriterStats {
        let c = &self.shared.counters;
        WriterStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            batches_written: c.batches_written.load(Ordering::Relaxed),
            buffered: self.buffered() as u64,
        }
    }
}

pub struct BatchWriter {
    shared: Arc<Shared>,
    sink: Arc<dyn TimeSeriesSink>,
    flush_interval: Duration,
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(config: &WriterConfig, sink: Arc<dyn TimeSeriesSink>) -> Self {
        let batch_size = config.batch_size.max(1);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer::default()),
            wake: Notify::new(),
            batch_size,
            max_buffer_size: config.max_buffer_size.max(batch_size + 1),
            counters: Counters::default(),
        });

        Self {
            shared,
            sink,
            flush_interval: config.flush_interval().max(Duration::from_millis(1)),
            retry: config.flush_retry_policy(),
        }
    }

    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run in the background until `shutdown` flips to true, then drain for at most `grace`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>, grace: Duration) -> JoinHandle<WriterStats> {
        tokio::spawn(self.run(shutdown, grace))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) -> WriterStats {
        info!(
            "🚀 Batch writer started: sink={}, batch_size={}, flush_interval={:?}, max_buffer={}",
            self.sink.name(),
            self.shared.batch_size,
            self.flush_interval,
            self.shared.max_buffer_size
        );

        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        // Set after a failed flush: wait for the next tick instead of hammering the sink
        let mut backing_off = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.shared.wake.notified(), if !backing_off => {
                    backing_off = !self.flush_while(|queued, batch| queued >= batch).await;
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    backing_off = !self.flush_while(|queued, _| queued > 0).await;
                }
            }
        }

        self.drain(grace).await;
        self.sink.close().await;

        let stats = self.handle().stats();
        info!(
            "🛑 Batch writer stopped: {} written in {} batches, {} dropped, {} failed flushes",
            stats.written, stats.batches_written, stats.dropped, stats.failed_flushes
        );
        stats
    }

    /// Flush batches while `ready(queued, batch_size)` holds. False if a flush failed.
    async fn flush_while<F>(&self, ready: F) -> bool
    where
        F: Fn(usize, usize) -> bool,
    {
        while ready(self.shared.queued(), self.shared.batch_size) {
            if self.flush_batch(self.retry.max_attempts).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Take one batch and write it with up to `max_attempts` attempts.
    async fn flush_batch(&self, max_attempts: u32) -> Result<usize, SinkError> {
        let batch = self.shared.take_batch();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let started = Instant::now();

        let mut attempts = 0;
        let last = loop {
            attempts += 1;
            match self.sink.write_batch(&batch).await {
                Ok(()) => {
                    self.shared.acknowledge(count);
                    let c = &self.shared.counters;
                    c.written.fetch_add(count as u64, Ordering::Relaxed);
                    c.batches_written.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "💾 Flushed {} readings to {} in {:?} (attempt {})",
                        count,
                        self.sink.name(),
                        started.elapsed(),
                        attempts
                    );
                    return Ok(count);
                }
                Err(SinkError::Rejected(reason)) => {
                    // Retrying cannot make the sink accept this batch
                    self.shared.acknowledge(count);
                    let c = &self.shared.counters;
                    c.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    c.dropped.fetch_add(count as u64, Ordering::Relaxed);
                    error!(
                        "❌ {} rejected a batch of {} readings, data lost: {}",
                        self.sink.name(),
                        count,
                        reason
                    );
                    return Err(SinkError::Rejected(reason));
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        break e.to_string();
                    }
                    let delay = self.retry.delay_for_attempt(attempts - 1);
                    warn!(
                        "⚠️ Write of {} readings to {} failed (attempt {}/{}): {}, retrying in {:?}",
                        count,
                        self.sink.name(),
                        attempts,
                        max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        };

        self.shared.requeue(batch);
        self.shared.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
        error!(
            "❌ Giving up on batch of {} readings after {} attempts, keeping it buffered ({} total): {}",
            count,
            attempts,
            self.shared.lock().total(),
            last
        );
        Err(SinkError::Exhausted { attempts, last })
    }

    async fn drain(&self, grace: Duration) {
        let pending = self.shared.lock().total();
        if pending == 0 {
            return;
        }
        info!("⏳ Draining {} buffered readings (grace {:?})", pending, grace);

        let drained = timeout(grace, async {
            while self.shared.queued() > 0 {
                if self.flush_batch(1).await.is_err() {
                    break;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Drain did not finish within {:?}", grace);
        }

        let left = self.shared.lock().total();
        if left > 0 {
            error!("❌ Shutting down with {} readings unwritten, data lost", left);
        }
    }
}
