use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;

use super::line_protocol::LineProtocol;
use super::sink::TimeSeriesSink;
use crate::config::InfluxConfig;
use crate::devices::DeviceReading;
use crate::utils::error::SinkError;

/// InfluxDB 1.x HTTP write API.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    encoder: LineProtocol,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig, encoder: LineProtocol) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SinkError::Rejected(format!("Failed to build HTTP client: {}", e)))?;

        let write_url = format!("{}/write", config.url.trim_end_matches('/'));
        info!("📡 InfluxDB sink: {} (database {})", write_url, config.database);

        Ok(Self {
            client,
            write_url,
            database: config.database.clone(),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            encoder,
        })
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write_batch(&self, readings: &[DeviceReading]) -> Result<(), SinkError> {
        if readings.is_empty() {
            return Ok(());
        }

        let body = self.encoder.encode_batch(readings);
        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!("InfluxDB accepted {} points", readings.len());
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status.as_u16(), detail.trim());
        if status.is_server_error() || status.as_u16() == 429 {
            Err(SinkError::Transient(message))
        } else {
            warn!("InfluxDB rejected batch of {} points: {}", readings.len(), message);
            Err(SinkError::Rejected(message))
        }
    }

    fn name(&self) -> &str {
        "influxdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::devices::{CounterEvent, DataQuality};
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    // Answers one HTTP request with `status` and hands back what it received
    async fn one_shot_http(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let content_length = text[..split]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= split + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (url, handle)
    }

    fn sink(url: String, username: Option<&str>) -> InfluxSink {
        let config = InfluxConfig {
            url,
            database: "plant".to_string(),
            username: username.map(str::to_string),
            password: Some("secret".to_string()),
            timeout_ms: 2000,
        };
        InfluxSink::new(&config, LineProtocol::new(&SinkConfig::default(), &[])).unwrap()
    }

    fn reading() -> DeviceReading {
        DeviceReading {
            device_id: "adam-1".to_string(),
            channel: 0,
            timestamp: Utc::now(),
            raw_value: Some(1000),
            processed_value: Some(1000.0),
            rate: None,
            quality: DataQuality::Good,
            event: CounterEvent::Baseline,
        }
    }

    #[tokio::test]
    async fn test_successful_write() {
        let (url, server) = one_shot_http("204 No Content").await;
        sink(url, Some("writer")).write_batch(&[reading()]).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /write?db=plant&precision=ms"));
        assert!(request.to_ascii_lowercase().contains("authorization: basic"));
        assert!(request.contains("counter_data,device=adam-1,channel=0 raw=1000i"));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (url, server) = one_shot_http("503 Service Unavailable").await;
        let err = sink(url, None).write_batch(&[reading()]).await.unwrap_err();
        assert!(matches!(err, SinkError::Transient(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let (url, server) = one_shot_http("400 Bad Request").await;
        let err = sink(url, None).write_batch(&[reading()]).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
        server.await.unwrap();
    }
}
