use async_trait::async_trait;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

use super::sink::TimeSeriesSink;
use crate::config::SqliteConfig;
use crate::devices::{CounterEvent, DeviceReading};
use crate::utils::error::SinkError;

const INSERT_REPLACE: &str = r#"
    INSERT OR REPLACE INTO counter_readings (
        device_id, channel, unix_ms, raw_value, processed_value, rate, quality, event
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_KEEP_EXISTING: &str = r#"
    INSERT OR IGNORE INTO counter_readings (
        device_id, channel, unix_ms, raw_value, processed_value, rate, quality, event
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Local time-series table for deployments without InfluxDB.
///
/// Rows are keyed by device, channel and millisecond, so redelivered batches overwrite
/// themselves. Out-of-order readings never replace a row already stored for that key.
#[derive(Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
    config: SqliteConfig,
}

impl SqliteSink {
    pub async fn new(config: SqliteConfig) -> Result<Self, SinkError> {
        // Create database directory if it doesn't exist
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SinkError::Rejected(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        info!("🗄️  Initializing SQLite database: {}", config.database_path);

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .journal_mode(if config.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let sink = Self { pool, config };
        sink.initialize_schema().await?;

        info!("✅ SQLite database initialized successfully");
        Ok(sink)
    }

    async fn initialize_schema(&self) -> Result<(), SinkError> {
        // Primary key makes re-delivered batches overwrite instead of duplicating
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counter_readings (
                device_id TEXT NOT NULL,
                channel INTEGER NOT NULL,
                unix_ms INTEGER NOT NULL,
                raw_value INTEGER,
                processed_value REAL,
                rate REAL,
                quality TEXT NOT NULL,
                event TEXT NOT NULL,
                PRIMARY KEY (device_id, channel, unix_ms)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_counter_time ON counter_readings(unix_ms)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn reading_count(&self) -> Result<i64, SinkError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM counter_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub fn database_path(&self) -> &str {
        &self.config.database_path
    }
}

#[async_trait]
impl TimeSeriesSink for SqliteSink {
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<(), SinkError> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for reading in readings {
            // An out-of-order sample can share a millisecond with the good one it trails
            let sql = if reading.event == CounterEvent::OutOfOrder {
                INSERT_KEEP_EXISTING
            } else {
                INSERT_REPLACE
            };
            sqlx::query(sql)
                .bind(&reading.device_id)
                .bind(reading.channel as i64)
                .bind(reading.unix_millis())
                .bind(reading.raw_value.map(|v| v as i64))
                .bind(reading.processed_value)
                .bind(reading.rate)
                .bind(reading.quality.as_str())
                .bind(reading.event.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("💾 Inserted {} counter readings", readings.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }

    async fn close(&self) {
        info!("🔒 Closing SQLite database connections");
        self.pool.close().await;
    }
}
