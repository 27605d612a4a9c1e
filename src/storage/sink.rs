use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::line_protocol::LineProtocol;
use crate::devices::DeviceReading;
use crate::utils::error::SinkError;

/// Append-only destination for flushed batches.
///
/// A call either stores the whole batch or fails; the writer re-sends failed batches, so
/// implementations must tolerate duplicates keyed by device, channel and timestamp.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<(), SinkError>;

    fn name(&self) -> &str;

    async fn close(&self) {}
}

/// Prints line protocol to stdout instead of storing it.
pub struct ConsoleSink {
    encoder: LineProtocol,
}

impl ConsoleSink {
    pub fn new(encoder: LineProtocol) -> Self {
        Self { encoder }
    }
}

#[async_trait]
impl TimeSeriesSink for ConsoleSink {
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<(), SinkError> {
        if !readings.is_empty() {
            println!("{}", self.encoder.encode_batch(readings));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    batches: Mutex<Vec<Vec<DeviceReading>>>,
    attempts: AtomicU32,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
}

/// Keeps batches in memory. Clones share storage, so a test can hand one clone to the
/// writer and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every write until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<DeviceReading>> {
        self.lock().clone()
    }

    pub fn readings(&self) -> Vec<DeviceReading> {
        self.lock().iter().flatten().cloned().collect()
    }

    /// Every write call, successful or not.
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<DeviceReading>>> {
        self.state.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<(), SinkError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Transient("memory sink unavailable".to_string()));
        }
        let injected = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::Transient("injected failure".to_string()));
        }

        debug!("Memory sink stored {} readings", readings.len());
        self.lock().push(readings.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
