//! InfluxDB line protocol for counter readings.
//!
//! One point per reading:
//! `counter_data,device=<id>,channel=<n>[,location=..][,static tags] raw=..i,processed=..,rate=..,quality="..",event=".." <unix ms>`

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::config::{DeviceConfig, SinkConfig};
use crate::devices::DeviceReading;

// Tags every point already carries; static tags may not shadow them
const RESERVED_TAGS: [&str; 3] = ["device", "channel", "location"];

#[derive(Debug, Clone)]
pub struct LineProtocol {
    measurement: String,
    static_tags: BTreeMap<String, String>,
    locations: HashMap<String, String>,
}

impl LineProtocol {
    pub fn new(sink: &SinkConfig, devices: &[DeviceConfig]) -> Self {
        let locations = devices
            .iter()
            .filter_map(|d| d.location.as_ref().map(|l| (d.device_id.clone(), l.clone())))
            .collect();

        let static_tags = sink
            .tags
            .iter()
            .filter(|(key, _)| !RESERVED_TAGS.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            measurement: sink.measurement.clone(),
            static_tags,
            locations,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn encode_point(&self, reading: &DeviceReading) -> String {
        let mut line = String::with_capacity(160);
        line.push_str(&escape_key(&self.measurement, false));

        let _ = write!(line, ",device={}", escape_key(&reading.device_id, true));
        let _ = write!(line, ",channel={}", reading.channel);
        if let Some(location) = self.locations.get(&reading.device_id) {
            let _ = write!(line, ",location={}", escape_key(location, true));
        }
        for (key, value) in &self.static_tags {
            if value.is_empty() {
                continue;
            }
            let _ = write!(line, ",{}={}", escape_key(key, true), escape_key(value, true));
        }

        let mut fields = Vec::with_capacity(5);
        if let Some(raw) = reading.raw_value {
            fields.push(format!("raw={}i", raw));
        }
        if let Some(processed) = reading.processed_value.filter(|v| v.is_finite()) {
            fields.push(format!("processed={}", processed));
        }
        if let Some(rate) = reading.rate.filter(|v| v.is_finite()) {
            fields.push(format!("rate={}", rate));
        }
        fields.push(format!("quality=\"{}\"", reading.quality.as_str()));
        fields.push(format!("event=\"{}\"", escape_string(reading.event.as_str())));

        let _ = write!(line, " {} {}", fields.join(","), reading.unix_millis());
        line
    }

    /// Newline separated body for one write request.
    pub fn encode_batch(&self, readings: &[DeviceReading]) -> String {
        readings
            .iter()
            .map(|r| self.encode_point(r))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// Measurement names escape commas and spaces, tag keys and values also escape '='
fn escape_key(value: &str, escape_equals: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' | ' ' => escaped.push('\\'),
            '=' if escape_equals => escaped.push('\\'),
            _ => {}
        }
        escaped.push(c);
    }
    escaped
}

fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
