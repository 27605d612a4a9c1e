use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::Path;

use crate::devices::DeviceHealthSnapshot;
use crate::services::WriterStats;

/// Health file scraped by external monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub collector: String,
    pub instance_id: String,
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<DeviceHealthSnapshot>,
    pub writer: WriterStats,
}

impl HealthReport {
    pub fn healthy_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_healthy).count()
    }

    /// Write as JSON next to `path` first and rename over it, so a reader never sees a
    /// half-written file.
    pub async fn write_to(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{HealthState, PollState};

    fn snapshot(id: &str, healthy: bool) -> DeviceHealthSnapshot {
        DeviceHealthSnapshot {
            device_id: id.to_string(),
            state: if healthy { HealthState::Healthy } else { HealthState::Unhealthy },
            poll_state: PollState::Sleeping,
            is_healthy: healthy,
            consecutive_failures: if healthy { 0 } else { 5 },
            consecutive_successes: if healthy { 5 } else { 0 },
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            total_polls: 5,
            total_failures: if healthy { 0 } else { 5 },
        }
    }

    #[tokio::test]
    async fn test_report_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status/health.json");
        let report = HealthReport {
            collector: "line 1".to_string(),
            instance_id: "abc".to_string(),
            generated_at: Utc::now(),
            devices: vec![snapshot("a", true), snapshot("b", false)],
            writer: WriterStats::default(),
        };
        assert_eq!(report.healthy_count(), 1);

        report.write_to(&path).await.unwrap();
        report.write_to(&path).await.unwrap();

        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["devices"][1]["state"], "unhealthy");
        assert_eq!(value["writer"]["dropped"], 0);
        assert!(!dir.path().join("status/health.json.tmp").exists());
    }
}
