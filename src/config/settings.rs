use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::devices::reading::{RegisterWidth, WordOrder};
use crate::utils::error::ConfigError;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    // Collector identification
    pub collector: CollectorInfo,

    // Device configuration
    pub devices: Vec<DeviceConfig>,

    // Counter processing
    pub processing: ProcessingConfig,

    // Health tracking and reporting
    pub health: HealthConfig,

    // Extra delay after repeated poll failures
    pub backoff: BackoffConfig,

    // Batched writes
    pub writer: WriterConfig,

    // Time-series store
    pub sink: SinkConfig,

    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorInfo {
    pub name: String,
    pub instance_id: String,
}

impl Default for CollectorInfo {
    fn default() -> Self {
        Self {
            name: "Counter Collector".to_string(),
            instance_id: String::new(),
        }
    }
}

/// Static description of one device. Never mutated once the pipeline starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub location: Option<String>,
    pub word_order: WordOrder,
    pub channels: Vec<ChannelConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            poll_interval_ms: 5000,
            timeout_ms: 3000,
            max_retries: 3,
            retry_delay_ms: 100,
            location: None,
            word_order: WordOrder::LowHigh,
            channels: Vec::new(),
        }
    }
}

impl DeviceConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    // Immediate retries inside one poll iteration
    pub fn read_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

/// Which registers compose one logical counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub channel_number: u16,
    pub start_register: u16,
    pub register_count: u16,
    pub scale_factor: f64,
    pub unit: String,
    pub enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_number: 0,
            start_register: 0,
            register_count: 2,
            scale_factor: 1.0,
            unit: "count".to_string(),
            enabled: true,
        }
    }
}

impl ChannelConfig {
    pub fn register_width(&self) -> Option<RegisterWidth> {
        RegisterWidth::from_register_count(self.register_count)
    }

    // Exclusive end, widened so 65535 + 2 cannot wrap
    pub fn end_register(&self) -> u32 {
        self.start_register as u32 + self.register_count as u32
    }

    fn overlaps(&self, other: &ChannelConfig) -> bool {
        (self.start_register as u32) < other.end_register()
            && (other.start_register as u32) < self.end_register()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound (scaled units per second) for accepting an overflow-corrected delta
    pub max_rate_per_second: f64,
    /// Samples further apart than this do not produce a rate
    pub max_gap_ms: u64,
    pub overflow_warning_ratio: f64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_rate_per_second: 100_000.0,
            max_gap_ms: 300_000,
            overflow_warning_ratio: 0.99,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub report_interval_ms: u64,
    pub report_path: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 3,
            report_interval_ms: 60_000,
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> Option<RetryPolicy> {
        if !self.enabled {
            return None;
        }
        Some(
            RetryPolicy::exponential(
                u32::MAX,
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
            .with_jitter(self.jitter),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_buffer_size: usize,
    pub max_flush_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5000,
            max_buffer_size: 10_000,
            max_flush_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_flush_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Influxdb,
    Sqlite,
    Console,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub measurement: String,
    /// Static tags added to every point
    pub tags: BTreeMap<String, String>,
    pub influxdb: InfluxConfig,
    pub sqlite: SqliteConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Influxdb,
            measurement: "counter_data".to_string(),
            tags: BTreeMap::new(),
            influxdb: InfluxConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            database: "adam_counters".to_string(),
            username: None,
            password: None,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SqliteConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub enable_wal: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: "data/counter_data.db".to_string(),
            max_connections: 4,
            busy_timeout_ms: 30_000,
            enable_wal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector: CollectorInfo::default(),
            devices: Vec::new(),
            processing: ProcessingConfig::default(),
            health: HealthConfig::default(),
            backoff: BackoffConfig::default(),
            writer: WriterConfig::default(),
            sink: SinkConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    /// Sample configuration: one ADAM-6051 style counter module with two 32-bit channels.
    pub fn sample() -> Self {
        let channels = (0..2u16)
            .map(|channel| ChannelConfig {
                channel_number: channel,
                start_register: channel * 2,
                register_count: 2,
                scale_factor: 1.0,
                unit: "items".to_string(),
                enabled: true,
            })
            .collect();

        Self {
            collector: CollectorInfo {
                name: "Counter Collector".to_string(),
                instance_id: Uuid::new_v4().to_string(),
            },
            devices: vec![DeviceConfig {
                device_id: "adam-6051-01".to_string(),
                host: "192.168.1.100".to_string(),
                location: Some("production_line_1".to_string()),
                channels,
                ..DeviceConfig::default()
            }],
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Generate instance id if not present
        if config.collector.instance_id.is_empty() {
            config.collector.instance_id = Uuid::new_v4().to_string();
        }

        debug!("Loaded {} device(s) from {}", config.devices.len(), path.display());
        Ok(config)
    }

    /// File, then environment overrides, then validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        // Create directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("INFLUXDB_URL") {
            self.sink.influxdb.url = url;
        }
        if let Some(database) = lookup("INFLUXDB_DATABASE") {
            self.sink.influxdb.database = database;
        }
        if let Some(username) = lookup("INFLUXDB_USERNAME") {
            self.sink.influxdb.username = Some(username);
        }
        if let Some(password) = lookup("INFLUXDB_PASSWORD") {
            self.sink.influxdb.password = Some(password);
        }
        if let Some(path) = lookup("SQLITE_PATH") {
            self.sink.sqlite.database_path = path;
        }
        if let Some(name) = lookup("COLLECTOR_NAME") {
            self.collector.name = name;
        }
        if let Some(raw) = lookup("POLL_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(interval) => {
                    info!("⏱️  POLL_INTERVAL_MS override: {} ms for all devices", interval);
                    for device in &mut self.devices {
                        device.poll_interval_ms = interval;
                    }
                }
                Err(_) => warn!("Ignoring invalid POLL_INTERVAL_MS value '{}'", raw),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut seen_ids = HashSet::new();
        for device in &self.devices {
            if device.device_id.trim().is_empty() {
                return Err(invalid("devices.device_id", "must not be empty"));
            }
            if !seen_ids.insert(device.device_id.as_str()) {
                return Err(ConfigError::DuplicateDeviceId(device.device_id.clone()));
            }
            validate_device(device)?;
        }

        if !(self.processing.max_rate_per_second > 0.0) {
            return Err(invalid("processing.max_rate_per_second", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.processing.overflow_warning_ratio) {
            return Err(invalid("processing.overflow_warning_ratio", "must be within 0.0..=1.0"));
        }
        if self.health.failure_threshold == 0 || self.health.recovery_threshold == 0 {
            return Err(invalid("health", "thresholds must be at least 1"));
        }
        if self.writer.batch_size == 0 {
            return Err(invalid("writer.batch_size", "must be at least 1"));
        }
        // Room for new readings while a full batch is in flight
        if self.writer.max_buffer_size <= self.writer.batch_size {
            return Err(invalid("writer.max_buffer_size", "must be larger than batch_size"));
        }
        if self.writer.max_flush_attempts == 0 {
            return Err(invalid("writer.max_flush_attempts", "must be at least 1"));
        }
        if self.writer.flush_interval_ms == 0 {
            return Err(invalid("writer.flush_interval_ms", "must be positive"));
        }
        if self.sink.measurement.is_empty() {
            return Err(invalid("sink.measurement", "must not be empty"));
        }

        Ok(())
    }

    pub fn get_device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn enabled_channel_count(&self) -> usize {
        self.devices.iter().map(|d| d.enabled_channels().count()).sum()
    }
}

fn validate_device(device: &DeviceConfig) -> Result<(), ConfigError> {
    let field = |name: &str| format!("devices[{}].{}", device.device_id, name);

    if device.host.trim().is_empty() {
        return Err(invalid(&field("host"), "must not be empty"));
    }
    if device.poll_interval_ms == 0 {
        return Err(invalid(&field("poll_interval_ms"), "must be positive"));
    }
    if device.timeout_ms == 0 {
        return Err(invalid(&field("timeout_ms"), "must be positive"));
    }
    if device.channels.is_empty() {
        return Err(invalid(&field("channels"), "at least one channel is required"));
    }

    let mut channel_numbers = HashSet::new();
    for (index, channel) in device.channels.iter().enumerate() {
        let channel_error = |reason: String| ConfigError::InvalidChannel {
            device_id: device.device_id.clone(),
            channel: channel.channel_number,
            reason,
        };

        if !channel_numbers.insert(channel.channel_number) {
            return Err(channel_error("duplicate channel number".to_string()));
        }
        if channel.register_width().is_none() {
            return Err(channel_error(format!(
                "register_count must be 1 (16-bit) or 2 (32-bit), got {}",
                channel.register_count
            )));
        }
        if channel.end_register() > u16::MAX as u32 + 1 {
            return Err(channel_error("register range exceeds address space".to_string()));
        }
        if !channel.scale_factor.is_finite() || channel.scale_factor <= 0.0 {
            return Err(channel_error(format!("invalid scale_factor {}", channel.scale_factor)));
        }

        // Disabled channels still occupy their registers
        for other in &device.channels[..index] {
            if channel.overlaps(other) {
                return Err(ConfigError::OverlappingRegisters {
                    device_id: device.device_id.clone(),
                    first: other.channel_number,
                    second: channel.channel_number,
                });
            }
        }
    }

    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
