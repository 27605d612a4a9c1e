use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;

use super::reading::{CounterEvent, DataQuality, DeviceReading, RegisterWidth};
use crate::config::ProcessingConfig;

/// Last accepted sample of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub raw: u32,
    pub timestamp: DateTime<Utc>,
    /// Running cumulative total in scaled units
    pub total: f64,
}

/// Turns raw counter samples into cumulative values and rates.
///
/// Holds the previous-value cache for every (device, channel) it has seen. Each poll loop
/// owns its own processor, so a key is only ever touched by one task. No I/O, never blocks.
#[derive(Debug)]
pub struct CounterProcessor {
    config: ProcessingConfig,
    baselines: HashMap<String, HashMap<u16, Baseline>>,
}

impl CounterProcessor {
    pub fn new(config: ProcessingConfig) -> Self {
        Self {
            config,
            baselines: HashMap::new(),
        }
    }

    pub fn baseline(&self, device_id: &str, channel: u16) -> Option<&Baseline> {
        self.baselines.get(device_id)?.get(&channel)
    }

    pub fn process(
        &mut self,
        device_id: &str,
        channel: u16,
        raw: u32,
        timestamp: DateTime<Utc>,
        width: RegisterWidth,
        scale_factor: f64,
    ) -> DeviceReading {
        self.process_sample(device_id, channel, raw, timestamp, width, scale_factor, false)
    }

    /// Like [`process`](Self::process); `degraded` marks a read that only succeeded after
    /// retries, which caps the quality at `Uncertain`.
    #[allow(clippy::too_many_arguments)]
    pub fn process_sample(
        &mut self,
        device_id: &str,
        channel: u16,
        raw: u32,
        timestamp: DateTime<Utc>,
        width: RegisterWidth,
        scale_factor: f64,
        degraded: bool,
    ) -> DeviceReading {
        let read_quality = if degraded { DataQuality::Uncertain } else { DataQuality::Good };
        let previous = self.baseline(device_id, channel).copied();

        self.warn_if_near_overflow(device_id, channel, raw, previous.map(|p| p.raw), width);

        let Some(previous) = previous else {
            let total = raw as f64 * scale_factor;
            self.store(device_id, channel, Baseline { raw, timestamp, total });
            return reading(device_id, channel, timestamp, raw, total, None, read_quality, CounterEvent::Baseline);
        };

        let elapsed = timestamp - previous.timestamp;
        let elapsed_us = elapsed
            .num_microseconds()
            .unwrap_or_else(|| elapsed.num_milliseconds().saturating_mul(1000));
        if elapsed_us <= 0 {
            warn!(
                "[{}] channel {}: timestamp {} not after previous sample {}, marking bad",
                device_id, channel, timestamp, previous.timestamp
            );
            return reading(
                device_id,
                channel,
                timestamp,
                raw,
                previous.total,
                None,
                DataQuality::Bad,
                CounterEvent::OutOfOrder,
            );
        }

        let elapsed_secs = elapsed_us as f64 / 1_000_000.0;
        let gap = elapsed_us as u64 > self.config.max_gap_ms.saturating_mul(1000);

        let (total, rate, quality, event) = if raw >= previous.raw {
            let delta = (raw - previous.raw) as f64 * scale_factor;
            let total = previous.total + delta;
            if gap {
                debug!("[{}] channel {}: {} ms since last sample, no rate", device_id, channel, elapsed.num_milliseconds());
                (total, None, DataQuality::Uncertain, CounterEvent::Gap)
            } else {
                (total, Some(delta / elapsed_secs), DataQuality::Good, CounterEvent::Increment)
            }
        } else {
            let corrected = (width.max_value() - previous.raw) as u64 + raw as u64 + 1;
            let delta = corrected as f64 * scale_factor;
            let rate = delta / elapsed_secs;

            if !gap && rate <= self.config.max_rate_per_second {
                debug!(
                    "[{}] channel {}: {} counter wrapped {} -> {}, corrected delta {}",
                    device_id, channel, width, previous.raw, raw, corrected
                );
                (previous.total + delta, Some(rate), DataQuality::Uncertain, CounterEvent::Overflow)
            } else {
                warn!(
                    "[{}] channel {}: counter dropped {} -> {} (implied rate {:.1}/s), treating as device reset",
                    device_id, channel, previous.raw, raw, rate
                );
                (raw as f64 * scale_factor, None, DataQuality::Uncertain, CounterEvent::Reset)
            }
        };

        self.store(device_id, channel, Baseline { raw, timestamp, total });
        reading(device_id, channel, timestamp, raw, total, rate, quality.worst(read_quality), event)
    }

    /// Bad reading for a failed read. The baseline is left untouched.
    pub fn failed_reading(&self, device_id: &str, channel: u16, timestamp: DateTime<Utc>) -> DeviceReading {
        DeviceReading {
            device_id: device_id.to_string(),
            channel,
            timestamp,
            raw_value: None,
            processed_value: self.baseline(device_id, channel).map(|b| b.total),
            rate: None,
            quality: DataQuality::Bad,
            event: CounterEvent::ReadFailure,
        }
    }

    fn store(&mut self, device_id: &str, channel: u16, baseline: Baseline) {
        match self.baselines.get_mut(device_id) {
            Some(channels) => {
                channels.insert(channel, baseline);
            }
            None => {
                let mut channels = HashMap::new();
                channels.insert(channel, baseline);
                self.baselines.insert(device_id.to_string(), channels);
            }
        }
    }

    fn warn_if_near_overflow(
        &self,
        device_id: &str,
        channel: u16,
        raw: u32,
        previous_raw: Option<u32>,
        width: RegisterWidth,
    ) {
        let threshold = width.max_value() as f64 * self.config.overflow_warning_ratio;
        let above = |value: u32| value as f64 >= threshold;
        if above(raw) && !previous_raw.map(above).unwrap_or(false) {
            warn!(
                "[{}] channel {} approaching {} overflow: {}",
                device_id, channel, width, raw
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn reading(
    device_id: &str,
    channel: u16,
    timestamp: DateTime<Utc>,
    raw: u32,
    total: f64,
    rate: Option<f64>,
    quality: DataQuality,
    event: CounterEvent,
) -> DeviceReading {
    DeviceReading {
        device_id: device_id.to_string(),
        channel,
        timestamp,
        raw_value: Some(raw),
        processed_value: Some(total),
        rate,
        quality,
        event,
    }
}
