use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::{Config, DeviceConfig};
use crate::devices::{DeviceHealthSnapshot, DeviceReading, HealthHandle};
use crate::modbus::{ModbusClientTrait, ModbusTcpClient};
use crate::services::batch_writer::{BatchWriter, WriterHandle, WriterStats};
use crate::services::poll_loop::{DevicePoller, PollerOptions};
use crate::storage::TimeSeriesSink;

const TAP_CAPACITY: usize = 1024;

/// What `stop` managed to shut down cleanly.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Final snapshot of every loop that reached `Stopped`
    pub stopped: Vec<DeviceHealthSnapshot>,
    /// Loops aborted after the timeout or lost to a panic
    pub abandoned: Vec<String>,
    pub writer: Option<WriterStats>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && self.writer.is_some()
    }
}

struct PollTask {
    device_id: String,
    handle: JoinHandle<DeviceHealthSnapshot>,
}

/// Runs one poll loop per device plus the batch writer they all feed.
pub struct DevicePool {
    tasks: Vec<PollTask>,
    health: Vec<HealthHandle>,
    writer: WriterHandle,
    writer_task: JoinHandle<WriterStats>,
    poll_shutdown: watch::Sender<bool>,
    writer_shutdown: watch::Sender<bool>,
    tap: broadcast::Sender<DeviceReading>,
}

impl DevicePool {
    /// Start polling every configured device over Modbus TCP.
    pub fn start(config: &Config, sink: Arc<dyn TimeSeriesSink>) -> Self {
        Self::start_with_clients(config, sink, |device| {
            Box::new(ModbusTcpClient::new(device.address(), device.timeout()))
        })
    }

    /// Like [`start`](Self::start) with caller-supplied clients.
    pub fn start_with_clients<F>(config: &Config, sink: Arc<dyn TimeSeriesSink>, mut make_client: F) -> Self
    where
        F: FnMut(&DeviceConfig) -> Box<dyn ModbusClientTrait>,
    {
        let (poll_shutdown, poll_rx) = watch::channel(false);
        let (writer_shutdown, writer_rx) = watch::channel(false);
        let (tap, _) = broadcast::channel(TAP_CAPACITY);

        let writer = BatchWriter::new(&config.writer, sink);
        let writer_handle = writer.handle();
        let writer_task = writer.spawn(writer_rx, config.shutdown.timeout());

        let options = PollerOptions::from_config(config);
        let mut tasks = Vec::with_capacity(config.devices.len());
        let mut health = Vec::with_capacity(config.devices.len());

        for device in &config.devices {
            let client = make_client(device);
            let poller = DevicePoller::new(device.clone(), client, writer_handle.clone(), &options)
                .with_tap(tap.clone());
            health.push(poller.health_handle());
            tasks.push(PollTask {
                device_id: device.device_id.clone(),
                handle: tokio::spawn(poller.run(poll_rx.clone())),
            });
        }

        info!("🚀 Device pool started with {} device(s)", tasks.len());
        Self {
            tasks,
            health,
            writer: writer_handle,
            writer_task,
            poll_shutdown,
            writer_shutdown,
            tap,
        }
    }

    pub fn device_count(&self) -> usize {
        self.tasks.len()
    }

    /// Current health snapshot of every device, in configuration order.
    pub fn health(&self) -> Vec<DeviceHealthSnapshot> {
        self.health.iter().map(HealthHandle::current).collect()
    }

    pub fn health_handles(&self) -> Vec<HealthHandle> {
        self.health.clone()
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    pub fn writer(&self) -> WriterHandle {
        self.writer.clone()
    }

    /// Every reading as it is produced, across all devices. Slow subscribers lag and
    /// miss readings; the writer is unaffected.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceReading> {
        self.tap.subscribe()
    }

    /// Stop every poll loop, then drain the writer. Each phase gets at most `grace`; loops
    /// still running after that are aborted and reported.
    pub async fn stop(self, grace: Duration) -> ShutdownReport {
        info!("🛑 Stopping {} poll loop(s)", self.tasks.len());
        self.poll_shutdown.send_replace(true);

        let mut report = ShutdownReport::default();
        let deadline = Instant::now() + grace;
        for mut task in self.tasks {
            match timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(snapshot)) => report.stopped.push(snapshot),
                Ok(Err(e)) => {
                    error!("❌ [{}] Poll loop failed: {}", task.device_id, e);
                    report.abandoned.push(task.device_id);
                }
                Err(_) => {
                    error!(
                        "❌ [{}] Poll loop did not stop within {:?}, abandoning it",
                        task.device_id, grace
                    );
                    task.handle.abort();
                    report.abandoned.push(task.device_id);
                }
            }
        }

        // Loops are done producing, let the writer drain what they left
        self.writer_shutdown.send_replace(true);
        let mut writer_task = self.writer_task;
        match timeout(grace, &mut writer_task).await {
            Ok(Ok(stats)) => report.writer = Some(stats),
            Ok(Err(e)) => error!("❌ Batch writer failed: {}", e),
            Err(_) => {
                writer_task.abort();
                let stats = self.writer.stats();
                error!(
                    "❌ Batch writer did not finish within {:?}, {} readings unwritten",
                    grace, stats.buffered
                );
            }
        }

        if report.is_clean() {
            info!("✅ Device pool stopped cleanly");
        } else {
            warn!("Device pool stopped with {} abandoned loop(s)", report.abandoned.len());
        }
        report
    }
}
