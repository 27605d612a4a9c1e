use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// How the caller's retry policy should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Transient,
    Fatal,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Transient => write!(f, "transient"),
            ErrorSeverity::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure to establish a TCP session with a device. Always transient.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection to {address} failed: {source}")]
    Refused {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {address} timed out after {timeout_ms} ms")]
    Timeout { address: String, timeout_ms: u64 },
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout occurred after {0} ms")]
    Timeout(u64),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Modbus exception 0x{code:02x} ({}) for function 0x{function:02x}", exception_name(*.code))]
    Exception { function: u8, code: u8 },

    #[error("Transaction id mismatch: sent {sent}, received {received}")]
    TransactionMismatch { sent: u16, received: u16 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),
}

impl ReadError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ReadError::Connection(_)
            | ReadError::NotConnected
            | ReadError::Timeout(_)
            | ReadError::CommunicationError(_)
            | ReadError::TransactionMismatch { .. } => ErrorSeverity::Transient,
            // Illegal function / address / value mean the channel map does not fit the device
            ReadError::Exception { code, .. } if *code <= 0x03 => ErrorSeverity::Fatal,
            ReadError::Exception { .. } => ErrorSeverity::Transient,
            ReadError::InvalidResponse(_) | ReadError::ConfigMismatch(_) => ErrorSeverity::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.severity() == ErrorSeverity::Transient
    }

    // Device unreachable rather than misbehaving: no point trying the other channels
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ReadError::Connection(_) | ReadError::NotConnected)
    }
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown",
    }
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::CommunicationError(format!("IO error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink temporarily unavailable: {0}")]
    Transient(String),

    #[error("Sink rejected batch: {0}")]
    Rejected(String),

    #[error("Write abandoned after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        SinkError::Transient(format!("Database error: {}", err))
    }
}

#[cfg(feature = "influxdb")]
impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Transient(format!("HTTP error: {}", err))
    }
}

/// Startup-time configuration problems. The only errors fatal to the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No devices configured")]
    NoDevices,

    #[error("Duplicate device id: {0}")]
    DuplicateDeviceId(String),

    #[error("Device {device_id}: channels {first} and {second} have overlapping register ranges")]
    OverlappingRegisters {
        device_id: String,
        first: u16,
        second: u16,
    },

    #[error("Device {device_id}, channel {channel}: {reason}")]
    InvalidChannel {
        device_id: String,
        channel: u16,
        reason: String,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_severity() {
        let illegal_address = ReadError::Exception { function: 0x03, code: 0x02 };
        assert_eq!(illegal_address.severity(), ErrorSeverity::Fatal);

        let busy = ReadError::Exception { function: 0x03, code: 0x06 };
        assert_eq!(busy.severity(), ErrorSeverity::Transient);
        assert!(busy.to_string().contains("server device busy"));
    }

    #[test]
    fn test_connection_errors_are_transient() {
        let err: ReadError = ConnectionError::Timeout {
            address: "10.0.0.1:502".to_string(),
            timeout_ms: 100,
        }
        .into();
        assert!(err.is_transient());
        assert!(err.is_connection_failure());
        assert!(!ReadError::InvalidResponse("short".into()).is_transient());
    }
}
