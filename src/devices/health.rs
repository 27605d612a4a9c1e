use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Where a device's poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Idle,
    Connecting,
    Polling,
    Sleeping,
    Stopped,
}

/// Immutable, published view of one device's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealthSnapshot {
    pub device_id: String,
    pub state: HealthState,
    pub poll_state: PollState,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_polls: u64,
    pub total_failures: u64,
}

impl DeviceHealthSnapshot {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            state: HealthState::Unknown,
            poll_state: PollState::Idle,
            is_healthy: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            total_polls: 0,
            total_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Per-device health state machine: `Unknown -> Healthy <-> Degraded -> Unhealthy`.
///
/// Mutated only by the poll loop that owns it. Every change publishes a fresh snapshot
/// through a watch channel, so readers always see a complete value.
#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    recovery_threshold: u32,
    current: DeviceHealthSnapshot,
    publisher: watch::Sender<DeviceHealthSnapshot>,
}

impl HealthTracker {
    pub fn new(device_id: &str, config: &HealthConfig) -> Self {
        let current = DeviceHealthSnapshot::new(device_id);
        let (publisher, _) = watch::channel(current.clone());
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            current,
            publisher,
        }
    }

    pub fn subscribe(&self) -> HealthHandle {
        HealthHandle {
            receiver: self.publisher.subscribe(),
        }
    }

    pub fn snapshot(&self) -> &DeviceHealthSnapshot {
        &self.current
    }

    pub fn state(&self) -> HealthState {
        self.current.state
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) -> Option<HealthTransition> {
        let s = &mut self.current;
        s.consecutive_successes = s.consecutive_successes.saturating_add(1);
        s.consecutive_failures = 0;
        s.last_success_at = Some(at);
        s.total_polls += 1;

        let next = match s.state {
            HealthState::Unknown | HealthState::Healthy => HealthState::Healthy,
            HealthState::Degraded if s.consecutive_successes >= self.recovery_threshold => HealthState::Healthy,
            HealthState::Degraded => HealthState::Degraded,
            HealthState::Unhealthy => HealthState::Degraded,
        };
        self.transition_to(next)
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, error: &str) -> Option<HealthTransition> {
        let s = &mut self.current;
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.consecutive_successes = 0;
        s.last_failure_at = Some(at);
        s.last_error = Some(error.to_string());
        s.total_polls += 1;
        s.total_failures += 1;

        let next = if s.consecutive_failures >= self.failure_threshold {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };
        self.transition_to(next)
    }

    pub fn set_poll_state(&mut self, poll_state: PollState) {
        if self.current.poll_state != poll_state {
            self.current.poll_state = poll_state;
            self.publish();
        }
    }

    fn transition_to(&mut self, next: HealthState) -> Option<HealthTransition> {
        let from = self.current.state;
        self.current.state = next;
        self.current.is_healthy = next == HealthState::Healthy;
        self.publish();

        (from != next).then_some(HealthTransition { from, to: next })
    }

    fn publish(&self) {
        self.publisher.send_replace(self.current.clone());
    }
}

/// Read-only side of a [`HealthTracker`], safe to hold from any task.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    receiver: watch::Receiver<DeviceHealthSnapshot>,
}

impl HealthHandle {
    pub fn current(&self) -> DeviceHealthSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn device_id(&self) -> String {
        self.receiver.borrow().device_id.clone()
    }

    /// Wait for the next published snapshot. `None` once the tracker is gone.
    pub async fn changed(&mut self) -> Option<DeviceHealthSnapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}
