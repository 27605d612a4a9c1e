use chrono::Utc;

use crate::devices::{DataQuality, DeviceHealthSnapshot, DeviceReading, HealthState};
use crate::services::WriterStats;

pub trait ReadingFormatter: Send + Sync {
    fn format_reading(&self, reading: &DeviceReading) -> String;
    fn format_health(&self, snapshots: &[DeviceHealthSnapshot], writer: Option<&WriterStats>) -> String;
    fn format_header(&self) -> String;

    fn format_readings(&self, readings: &[DeviceReading]) -> String {
        readings
            .iter()
            .map(|r| self.format_reading(r))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Create a formatter by name; unknown names fall back to the console format.
pub fn formatter_for(name: &str) -> Box<dyn ReadingFormatter> {
    match name {
        "json" => Box::new(JsonFormatter),
        _ => Box::new(ConsoleFormatter),
    }
}

pub struct ConsoleFormatter;

impl ConsoleFormatter {
    fn quality_icon(quality: DataQuality) -> &'static str {
        match quality {
            DataQuality::Good => "✅",
            DataQuality::Uncertain => "⚠️",
            DataQuality::Bad => "❌",
        }
    }

    fn health_icon(state: HealthState) -> &'static str {
        match state {
            HealthState::Healthy => "💚",
            HealthState::Degraded => "🟡",
            HealthState::Unhealthy => "🔴",
            HealthState::Unknown => "⚪",
        }
    }
}

impl ReadingFormatter for ConsoleFormatter {
    fn format_reading(&self, r: &DeviceReading) -> String {
        let opt = |v: Option<f64>, precision: usize| match v {
            Some(v) => format!("{:.*}", precision, v),
            None => "-".to_string(),
        };
        format!(
            "{} {} [{}] ch{} raw={} total={} rate={}/s {} ({})",
            Self::quality_icon(r.quality),
            r.timestamp.format("%H:%M:%S%.3f"),
            r.device_id,
            r.channel,
            r.raw_value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            opt(r.processed_value, 2),
            opt(r.rate, 3),
            r.quality,
            r.event
        )
    }

    fn format_health(&self, snapshots: &[DeviceHealthSnapshot], writer: Option<&WriterStats>) -> String {
        let mut output = String::from("📊 Device health:\n");
        for s in snapshots {
            output.push_str(&format!(
                "  {} {:<20} {:<9} polls={} failures={} streak={}/{}",
                Self::health_icon(s.state),
                s.device_id,
                s.state.to_string(),
                s.total_polls,
                s.total_failures,
                s.consecutive_successes,
                s.consecutive_failures
            ));
            if let Some(error) = s.last_error.as_ref().filter(|_| s.consecutive_failures > 0) {
                output.push_str(&format!(" last_error=\"{}\"", error));
            }
            output.push('\n');
        }
        if let Some(w) = writer {
            output.push_str(&format!(
                "  💾 writer: written={} buffered={} dropped={} failed_flushes={}\n",
                w.written, w.buffered, w.dropped, w.failed_flushes
            ));
        }
        output
    }

    fn format_header(&self) -> String {
        format!("🚀 Counter readings - {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

pub struct JsonFormatter;

impl ReadingFormatter for JsonFormatter {
    fn format_reading(&self, reading: &DeviceReading) -> String {
        serde_json::to_string(reading).unwrap_or_default()
    }

    fn format_health(&self, snapshots: &[DeviceHealthSnapshot], writer: Option<&WriterStats>) -> String {
        let result = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "devices": snapshots,
            "writer": writer,
        });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new() // JSON doesn't need headers
    }
}
