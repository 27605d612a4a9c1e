pub mod settings;

pub use settings::{
    BackoffConfig,
    ChannelConfig,
    CollectorInfo,
    Config,
    DeviceConfig,
    HealthConfig,
    InfluxConfig,
    ProcessingConfig,
    ShutdownConfig,
    SinkConfig,
    SinkKind,
    SqliteConfig,
    WriterConfig,
};
