//! Modbus TCP counter acquisition
//!
//! Polls counter modules (ADAM-6051 style) over Modbus TCP, turns raw register values
//! into totals and rates with wrap and reset detection, tracks per-device health and
//! writes readings in batches to a time-series store.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{CounterProcessor, DataQuality, DeviceHealthSnapshot, DeviceReading, HealthState, HealthTracker};
pub use modbus::{ModbusClientTrait, ModbusTcpClient};
pub use services::{BatchWriter, DevicePool, ShutdownReport, WriterStats};
pub use storage::{build_sink, MemorySink, TimeSeriesSink};
pub use utils::error::{ConfigError, ConnectionError, ReadError, SinkError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
