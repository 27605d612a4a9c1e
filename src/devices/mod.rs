pub mod counter;
pub mod health;
pub mod reading;

pub use counter::{Baseline, CounterProcessor};
pub use health::{DeviceHealthSnapshot, HealthHandle, HealthState, HealthTracker, HealthTransition, PollState};
pub use reading::{CounterEvent, DataQuality, DeviceReading, RegisterWidth, WordOrder};
