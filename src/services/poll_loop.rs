use chrono::Utc;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant};

use crate::config::{BackoffConfig, ChannelConfig, Config, DeviceConfig, HealthConfig, ProcessingConfig};
use crate::devices::{
    CounterProcessor, DeviceHealthSnapshot, DeviceReading, HealthHandle, HealthState, HealthTracker, PollState,
    RegisterWidth,
};
use crate::modbus::ModbusClientTrait;
use crate::services::batch_writer::WriterHandle;
use crate::utils::error::ReadError;
use crate::utils::retry::RetryPolicy;

/// Pipeline settings every poll loop shares.
#[derive(Debug, Clone, Default)]
pub struct PollerOptions {
    pub processing: ProcessingConfig,
    pub health: HealthConfig,
    pub backoff: BackoffConfig,
}

impl PollerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            processing: config.processing.clone(),
            health: config.health.clone(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Result of one poll iteration.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// One reading per enabled channel, Bad for channels that could not be read
    pub readings: Vec<DeviceReading>,
    pub failed_channels: usize,
    pub error: Option<String>,
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        self.failed_channels == 0
    }
}

/// Polls one device on its own cadence until told to stop.
///
/// Owns the device's client, its counter baselines and its health tracker; nothing here
/// is shared with other devices. Readings go to the writer and, when attached, to a
/// broadcast tap.
pub struct DevicePoller {
    config: DeviceConfig,
    client: Box<dyn ModbusClientTrait>,
    processor: CounterProcessor,
    health: HealthTracker,
    writer: WriterHandle,
    tap: Option<broadcast::Sender<DeviceReading>>,
    read_retry: RetryPolicy,
    backoff: Option<RetryPolicy>,
}

impl DevicePoller {
    pub fn new(
        config: DeviceConfig,
        client: Box<dyn ModbusClientTrait>,
        writer: WriterHandle,
        options: &PollerOptions,
    ) -> Self {
        Self {
            processor: CounterProcessor::new(options.processing.clone()),
            health: HealthTracker::new(&config.device_id, &options.health),
            read_retry: config.read_retry_policy(),
            backoff: options.backoff.policy(),
            config,
            client,
            writer,
            tap: None,
        }
    }

    pub fn with_tap(mut self, tap: broadcast::Sender<DeviceReading>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn health_handle(&self) -> HealthHandle {
        self.health.subscribe()
    }

    pub fn health(&self) -> &DeviceHealthSnapshot {
        self.health.snapshot()
    }

    /// Loop until `shutdown` becomes true (or its sender is dropped). The connection is
    /// closed on every exit path.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DeviceHealthSnapshot {
        let interval = self.config.poll_interval();
        info!(
            "▶️  [{}] Polling {} channel(s) at {} every {:?}",
            self.config.device_id,
            self.config.enabled_channels().count(),
            self.client.address(),
            interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                outcome = self.poll_once() => outcome,
            };

            let elapsed = started.elapsed();
            if elapsed > interval {
                warn!(
                    "[{}] Poll took {:?}, longer than the {:?} interval",
                    self.config.device_id, elapsed, interval
                );
            }
            let delay = interval.saturating_sub(elapsed) + self.backoff_delay();
            if !outcome.is_success() {
                debug!("[{}] Next poll in {:?}", self.config.device_id, delay);
            }

            self.health.set_poll_state(PollState::Sleeping);
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = sleep(delay) => {}
            }
        }

        self.client.close().await;
        self.health.set_poll_state(PollState::Stopped);
        info!("⏹️  [{}] Poll loop stopped", self.config.device_id);
        self.health.snapshot().clone()
    }

    /// One iteration: connect if needed, read every enabled channel, process, emit,
    /// update health.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let channels: Vec<ChannelConfig> = self.config.enabled_channels().cloned().collect();
        let mut readings = Vec::with_capacity(channels.len());
        let mut failed_channels = 0;
        let mut first_error: Option<String> = None;

        let mut unreachable = None;
        if !self.client.is_connected() {
            self.health.set_poll_state(PollState::Connecting);
            if let Err(e) = self.connect_with_retry().await {
                unreachable = Some(e);
            }
        }
        self.health.set_poll_state(PollState::Polling);

        for channel in &channels {
            if let Some(reason) = &unreachable {
                readings.push(self.processor.failed_reading(&self.config.device_id, channel.channel_number, Utc::now()));
                failed_channels += 1;
                first_error.get_or_insert_with(|| reason.clone());
                continue;
            }

            match self.read_channel(channel).await {
                Ok((raw, width, degraded)) => {
                    readings.push(self.processor.process_sample(
                        &self.config.device_id,
                        channel.channel_number,
                        raw,
                        Utc::now(),
                        width,
                        channel.scale_factor,
                        degraded,
                    ));
                }
                Err(e) => {
                    warn!(
                        "[{}] channel {}: read failed ({}): {}",
                        self.config.device_id,
                        channel.channel_number,
                        e.severity(),
                        e
                    );
                    readings.push(self.processor.failed_reading(&self.config.device_id, channel.channel_number, Utc::now()));
                    failed_channels += 1;
                    first_error.get_or_insert_with(|| e.to_string());

                    // Device gone: the remaining channels would only time out one by one
                    if e.is_connection_failure() {
                        unreachable = Some(e.to_string());
                    }
                }
            }
        }

        let now = Utc::now();
        let transition = match &first_error {
            None => self.health.record_success(now),
            Some(error) => self.health.record_failure(now, error),
        };
        if let Some(t) = transition {
            match t.to {
                HealthState::Healthy => info!("💚 [{}] Device {} -> {}", self.config.device_id, t.from, t.to),
                HealthState::Degraded if t.from == HealthState::Unhealthy => {
                    info!("[{}] Device recovering: {} -> {}", self.config.device_id, t.from, t.to)
                }
                _ => warn!(
                    "⚠️ [{}] Device {} -> {} after {} consecutive failure(s): {}",
                    self.config.device_id,
                    t.from,
                    t.to,
                    self.health.snapshot().consecutive_failures,
                    first_error.as_deref().unwrap_or("unknown error")
                ),
            }
        }

        for reading in &readings {
            self.emit(reading.clone());
        }

        PollOutcome {
            readings,
            failed_channels,
            error: first_error,
        }
    }

    async fn connect_with_retry(&mut self) -> Result<(), String> {
        let mut retries = 0;
        loop {
            match self.client.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if self.read_retry.should_retry(retries) => {
                    debug!("[{}] Connect attempt {} failed: {}", self.config.device_id, retries + 1, e);
                    sleep(self.read_retry.delay_for_attempt(retries)).await;
                    retries += 1;
                }
                Err(e) => {
                    warn!("[{}] Device unreachable: {}", self.config.device_id, e);
                    return Err(e.to_string());
                }
            }
        }
    }

    /// Read and decode one channel. The flag is true when the value needed retries.
    async fn read_channel(&mut self, channel: &ChannelConfig) -> Result<(u32, RegisterWidth, bool), ReadError> {
        let width = channel.register_width().ok_or_else(|| {
            ReadError::ConfigMismatch(format!("unsupported register count {}", channel.register_count))
        })?;

        let mut retries = 0;
        loop {
            let result = self
                .client
                .read_holding_registers(
                    self.config.unit_id,
                    channel.start_register,
                    width.register_count(),
                    self.config.timeout(),
                )
                .await;

            let error = match result {
                Ok(registers) => {
                    return width
                        .decode(&registers, self.config.word_order)
                        .map(|raw| (raw, width, retries > 0))
                        .ok_or_else(|| ReadError::InvalidResponse(format!("{} registers for {}", registers.len(), width)));
                }
                Err(e) => e,
            };

            if !error.is_transient() || !self.read_retry.should_retry(retries) {
                return Err(error);
            }

            let delay = self.read_retry.delay_for_attempt(retries);
            retries += 1;
            debug!(
                "[{}] channel {}: {} (retry {}/{} in {:?})",
                self.config.device_id, channel.channel_number, error, retries, self.read_retry.max_attempts, delay
            );
            sleep(delay).await;
        }
    }

    fn backoff_delay(&self) -> Duration {
        let failures = self.health.snapshot().consecutive_failures;
        match &self.backoff {
            Some(policy) if failures >= 2 => policy.delay_for_attempt(failures - 2),
            _ => Duration::ZERO,
        }
    }

    fn emit(&self, reading: DeviceReading) {
        if let Some(tap) = &self.tap {
            // No subscribers is fine
            let _ = tap.send(reading.clone());
        }
        self.writer.enqueue(reading);
    }
}

/// Resolves once the flag is true or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{CounterEvent, DataQuality};
    use crate::modbus::{MockModbusServer, ModbusTcpClient};
    use crate::services::batch_writer::BatchWriter;
    use crate::storage::MemorySink;
    use crate::utils::error::ConnectionError;
    use crate::config::WriterConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    enum Step {
        Registers(Vec<u16>),
        Timeout,
        Exception(u8),
        Disconnected,
    }

    #[derive(Default)]
    struct Calls {
        reads: AtomicUsize,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct ScriptedClient {
        steps: Arc<Mutex<VecDeque<Step>>>,
        refuse_connects: usize,
        connected: bool,
        calls: Arc<Calls>,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>) -> (Self, Arc<Calls>) {
            let calls = Arc::new(Calls::default());
            let client = Self {
                steps: Arc::new(Mutex::new(steps.into())),
                refuse_connects: 0,
                connected: false,
                calls: calls.clone(),
            };
            (client, calls)
        }
    }

    #[async_trait]
    impl ModbusClientTrait for ScriptedClient {
        async fn connect(&mut self) -> Result<(), ConnectionError> {
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connects > 0 {
                self.refuse_connects -= 1;
                return Err(ConnectionError::Timeout {
                    address: "scripted".to_string(),
                    timeout_ms: 1,
                });
            }
            self.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn read_holding_registers(
            &mut self,
            _unit_id: u8,
            _start_register: u16,
            _count: u16,
            _timeout: Duration,
        ) -> Result<Vec<u16>, ReadError> {
            self.calls.reads.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Timeout);
            let result = match step {
                Step::Registers(registers) => Ok(registers),
                Step::Timeout => Err(ReadError::Timeout(1)),
                Step::Exception(code) => Err(ReadError::Exception { function: 0x03, code }),
                Step::Disconnected => Err(ReadError::NotConnected),
            };
            if result.is_err() {
                self.connected = false;
            }
            result
        }

        async fn close(&mut self) {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            self.connected = false;
        }

        fn address(&self) -> &str {
            "scripted:502"
        }
    }

    fn device(channels: u16) -> DeviceConfig {
        DeviceConfig {
            device_id: "adam-test".to_string(),
            poll_interval_ms: 20,
            max_retries: 2,
            retry_delay_ms: 1,
            channels: (0..channels)
                .map(|n| ChannelConfig {
                    channel_number: n,
                    start_register: n * 2,
                    ..ChannelConfig::default()
                })
                .collect(),
            ..DeviceConfig::default()
        }
    }

    fn options() -> PollerOptions {
        PollerOptions {
            health: HealthConfig {
                failure_threshold: 2,
                recovery_threshold: 2,
                ..HealthConfig::default()
            },
            backoff: BackoffConfig {
                enabled: false,
                ..BackoffConfig::default()
            },
            ..PollerOptions::default()
        }
    }

    fn writer() -> (BatchWriter, MemorySink) {
        let sink = MemorySink::new();
        (BatchWriter::new(&WriterConfig::default(), Arc::new(sink.clone())), sink)
    }

    fn poller(client: ScriptedClient, channels: u16, writer: &BatchWriter) -> DevicePoller {
        DevicePoller::new(device(channels), Box::new(client), writer.handle(), &options())
    }

    #[tokio::test]
    async fn test_successful_poll_emits_one_reading_per_channel() {
        let (client, calls) = ScriptedClient::new(vec![
            Step::Registers(vec![1000, 0]),
            Step::Registers(vec![0, 1]),
        ]);
        let (writer, _) = writer();
        let mut poller = poller(client, 2, &writer);

        let outcome = poller.poll_once().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.readings.len(), 2);
        assert_eq!(outcome.readings[0].raw_value, Some(1000));
        assert_eq!(outcome.readings[1].raw_value, Some(65536));
        assert!(outcome.readings.iter().all(|r| r.quality == DataQuality::Good && r.rate.is_none()));
        assert_eq!(poller.health().state, HealthState::Healthy);
        assert_eq!(calls.connects.load(Ordering::SeqCst), 1);
        assert_eq!(writer.handle().buffered(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_and_degrades_quality() {
        let (client, calls) = ScriptedClient::new(vec![Step::Timeout, Step::Registers(vec![5, 0])]);
        let (writer, _) = writer();
        let mut poller = poller(client, 1, &writer);

        let outcome = poller.poll_once().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.readings[0].raw_value, Some(5));
        assert_eq!(outcome.readings[0].quality, DataQuality::Uncertain);
        assert_eq!(calls.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let (client, calls) = ScriptedClient::new(vec![Step::Exception(0x02), Step::Registers(vec![7, 0])]);
        let (writer, _) = writer();
        let mut poller = poller(client, 2, &writer);

        let outcome = poller.poll_once().await;
        assert_eq!(outcome.failed_channels, 1);
        assert_eq!(outcome.readings[0].quality, DataQuality::Bad);
        assert_eq!(outcome.readings[0].event, CounterEvent::ReadFailure);
        // Only the failing channel is affected
        assert_eq!(outcome.readings[1].raw_value, Some(7));
        assert_eq!(calls.reads.load(Ordering::SeqCst), 2);
        assert_eq!(poller.health().state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (client, calls) = ScriptedClient::new(vec![Step::Timeout, Step::Timeout, Step::Timeout, Step::Registers(vec![1, 0])]);
        let (writer, _) = writer();
        let mut poller = poller(client, 1, &writer);

        let outcome = poller.poll_once().await;
        assert!(!outcome.is_success());
        // One attempt plus max_retries
        assert_eq!(calls.reads.load(Ordering::SeqCst), 3);
        assert!(outcome.error.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn test_unreachable_device_marks_every_channel_bad() {
        let (mut client, calls) = ScriptedClient::new(vec![]);
        client.refuse_connects = 10;
        let (writer, _) = writer();
        let mut poller = poller(client, 3, &writer);

        for _ in 0..2 {
            let outcome = poller.poll_once().await;
            assert_eq!(outcome.failed_channels, 3);
            assert!(outcome.readings.iter().all(|r| r.is_bad()));
        }
        assert_eq!(calls.reads.load(Ordering::SeqCst), 0);
        // Initial attempt plus two retries, per iteration
        assert_eq!(calls.connects.load(Ordering::SeqCst), 6);
        assert_eq!(poller.health().state, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_lost_connection_skips_remaining_channels() {
        let (client, calls) = ScriptedClient::new(vec![Step::Disconnected, Step::Disconnected, Step::Disconnected]);
        let (writer, _) = writer();
        let mut poller = poller(client, 3, &writer);

        let outcome = poller.poll_once().await;
        assert_eq!(outcome.failed_channels, 3);
        assert_eq!(calls.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_read_keeps_baseline() {
        let (client, _) = ScriptedClient::new(vec![
            Step::Registers(vec![1000, 0]),
            Step::Exception(0x02),
            Step::Registers(vec![1100, 0]),
        ]);
        let (writer, _) = writer();
        let mut poller = poller(client, 1, &writer);

        poller.poll_once().await;
        let failed = poller.poll_once().await;
        assert_eq!(failed.readings[0].processed_value, Some(1000.0));

        sleep(Duration::from_millis(5)).await;
        let recovered = poller.poll_once().await;
        assert_eq!(recovered.readings[0].processed_value, Some(1100.0));
        assert_eq!(recovered.readings[0].event, CounterEvent::Increment);
    }

    #[tokio::test]
    async fn test_tap_receives_readings() {
        let (client, _) = ScriptedClient::new(vec![Step::Registers(vec![3, 0])]);
        let (writer, _) = writer();
        let (tx, mut rx) = broadcast::channel(8);
        let mut poller = poller(client, 1, &writer).with_tap(tx);

        poller.poll_once().await;
        assert_eq!(rx.recv().await.unwrap().raw_value, Some(3));
    }

    #[tokio::test]
    async fn test_run_stops_and_closes_connection() {
        let steps: Vec<Step> = (0..100u16).map(|i| Step::Registers(vec![i * 10, 0])).collect();
        let (client, calls) = ScriptedClient::new(steps);
        let (writer, _) = writer();
        let handle = writer.handle();
        let poller = poller(client, 1, &writer);
        let health = poller.health_handle();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(poller.run(rx));

        while handle.buffered() < 3 {
            sleep(Duration::from_millis(5)).await;
        }
        tx.send_replace(true);
        let last = task.await.unwrap();

        assert_eq!(last.poll_state, PollState::Stopped);
        assert_eq!(health.current().poll_state, PollState::Stopped);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_polls_mock_device() {
        let server = MockModbusServer::start().await.unwrap();
        server.set_counter(0, 70_000).await;
        server.set_counter(2, 5).await;

        let mut config = device(2);
        config.host = "127.0.0.1".to_string();
        config.port = server.address().rsplit(':').next().unwrap().parse().unwrap();
        let client = ModbusTcpClient::new(config.address(), config.timeout());
        let (writer, _) = writer();
        let mut poller = DevicePoller::new(config, Box::new(client), writer.handle(), &options());

        let outcome = poller.poll_once().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.readings[0].raw_value, Some(70_000));
        assert_eq!(outcome.readings[1].raw_value, Some(5));
        server.shutdown().await;
    }
}
