#[cfg(feature = "influxdb")]
pub mod influx;
pub mod line_protocol;
pub mod sink;
#[cfg(feature = "sqlite")]
pub mod sqlite_manager;

use std::sync::Arc;

use crate::config::{Config, SinkKind};
use crate::utils::error::SinkError;

#[cfg(feature = "influxdb")]
pub use influx::InfluxSink;
pub use line_protocol::LineProtocol;
pub use sink::{ConsoleSink, MemorySink, TimeSeriesSink};
#[cfg(feature = "sqlite")]
pub use sqlite_manager::SqliteSink;

/// Build the sink selected by `[sink] kind`.
pub async fn build_sink(config: &Config) -> Result<Arc<dyn TimeSeriesSink>, SinkError> {
    let encoder = LineProtocol::new(&config.sink, &config.devices);

    match config.sink.kind {
        SinkKind::Console => Ok(Arc::new(ConsoleSink::new(encoder))),

        #[cfg(feature = "influxdb")]
        SinkKind::Influxdb => Ok(Arc::new(InfluxSink::new(&config.sink.influxdb, encoder)?)),
        #[cfg(not(feature = "influxdb"))]
        SinkKind::Influxdb => Err(SinkError::Rejected(
            "built without the influxdb feature".to_string(),
        )),

        #[cfg(feature = "sqlite")]
        SinkKind::Sqlite => Ok(Arc::new(SqliteSink::new(config.sink.sqlite.clone()).await?)),
        #[cfg(not(feature = "sqlite"))]
        SinkKind::Sqlite => Err(SinkError::Rejected("built without the sqlite feature".to_string())),
    }
}
