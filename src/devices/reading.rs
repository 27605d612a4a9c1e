use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counter width, derived from how many 16-bit registers a channel spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterWidth {
    Bits16,
    Bits32,
}

impl RegisterWidth {
    pub fn from_register_count(count: u16) -> Option<Self> {
        match count {
            1 => Some(RegisterWidth::Bits16),
            2 => Some(RegisterWidth::Bits32),
            _ => None,
        }
    }

    pub fn register_count(self) -> u16 {
        match self {
            RegisterWidth::Bits16 => 1,
            RegisterWidth::Bits32 => 2,
        }
    }

    pub fn max_value(self) -> u32 {
        match self {
            RegisterWidth::Bits16 => u16::MAX as u32,
            RegisterWidth::Bits32 => u32::MAX,
        }
    }

    /// Combine raw registers into one counter value. `None` if too few registers came back.
    pub fn decode(self, registers: &[u16], order: WordOrder) -> Option<u32> {
        match self {
            RegisterWidth::Bits16 => registers.first().map(|&r| r as u32),
            RegisterWidth::Bits32 => {
                let (first, second) = (*registers.first()?, *registers.get(1)?);
                let (high, low) = match order {
                    WordOrder::LowHigh => (second, first),
                    WordOrder::HighLow => (first, second),
                };
                Some(((high as u32) << 16) | low as u32)
            }
        }
    }
}

impl fmt::Display for RegisterWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterWidth::Bits16 => write!(f, "16-bit"),
            RegisterWidth::Bits32 => write!(f, "32-bit"),
        }
    }
}

/// Register order of 32-bit counters. ADAM-60xx modules put the low word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    #[default]
    LowHigh,
    HighLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Good,
    Uncertain,
    Bad,
}

impl DataQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            DataQuality::Good => "good",
            DataQuality::Uncertain => "uncertain",
            DataQuality::Bad => "bad",
        }
    }

    /// The worse of two qualities. Quality only ever moves towards `Bad`.
    pub fn worst(self, other: DataQuality) -> DataQuality {
        self.max(other)
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the processor concluded about a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterEvent {
    /// First sample for the channel, no rate yet
    Baseline,
    Increment,
    /// Counter wrapped past its maximum
    Overflow,
    /// Counter went backwards implausibly, treated as a device reset
    Reset,
    /// Too long since the previous sample to derive a rate
    Gap,
    /// Timestamp not after the previous sample
    OutOfOrder,
    ReadFailure,
}

impl CounterEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterEvent::Baseline => "baseline",
            CounterEvent::Increment => "increment",
            CounterEvent::Overflow => "overflow",
            CounterEvent::Reset => "reset",
            CounterEvent::Gap => "gap",
            CounterEvent::OutOfOrder => "out_of_order",
            CounterEvent::ReadFailure => "read_failure",
        }
    }
}

impl fmt::Display for CounterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical unit the pipeline produces and the writer batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub device_id: String,
    pub channel: u16,
    pub timestamp: DateTime<Utc>,
    pub raw_value: Option<u32>,
    /// Cumulative count in scaled units, monotonic across overflow wraps
    pub processed_value: Option<f64>,
    /// Scaled units per second; `None` without two consecutive valid samples
    pub rate: Option<f64>,
    pub quality: DataQuality,
    pub event: CounterEvent,
}

impl DeviceReading {
    pub fn unix_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn is_bad(&self) -> bool {
        self.quality == DataQuality::Bad
    }
}
