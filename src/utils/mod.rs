pub mod error;
pub mod retry;

pub use error::{ConfigError, ConnectionError, ErrorSeverity, ReadError, SinkError};
pub use retry::RetryPolicy;
