//! Target and record model types.

use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::time::Duration;

/// Which probe a target is fetched with each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchProbes {
    /// Polling disabled; cycles are skipped.
    Off,
    #[default]
    Snmp,
    Http,
    Https,
}

impl FetchProbes {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "snmp" => Some(Self::Snmp),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    /// Default web UI port for the HTTP variants.
    pub fn default_http_port(self) -> u16 {
        match self {
            Self::Https => 443,
            _ => 80,
        }
    }
}

impl fmt::Display for FetchProbes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Snmp => "snmp",
            Self::Http => "http",
            Self::Https => "https",
        };
        f.write_str(s)
    }
}

/// SNMP credentials for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpCredentials {
    V2c { community: String },
    V3 { username: String, password: String },
}

/// Login for the network management card web UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCredentials {
    pub username: String,
    pub password: String,
}

/// Values from the target list that stand in for data a device doesn't report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOverrides {
    pub sku: Option<String>,
    pub rated_va: Option<u32>,
    pub rated_watts: Option<u32>,
}

/// A configured UPS device.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub address: String,
    pub overrides: DeviceOverrides,
    pub snmp: SnmpCredentials,
    pub snmp_port: u16,
    pub http: Option<HttpCredentials>,
    pub http_port: u16,
    pub fetch_probes: FetchProbes,
    /// Per-target interval override.
    pub interval: Option<Duration>,
    /// Per-target timeout override.
    pub timeout: Option<Duration>,
}

impl Target {
    pub fn effective_interval(&self, default: Duration) -> Duration {
        self.interval.unwrap_or(default)
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// A named sensor value (temperature, humidity, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub name: String,
    pub value: f64,
}

impl SensorReading {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One normalized snapshot of a device.
///
/// Anything the device did not report stays `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub model: Option<String>,
    pub sku: Option<String>,
    pub sensitivity: Option<String>,
    pub status: Option<String>,
    pub last_transfer_reason: Option<String>,
    pub battery_needs_replacement: Option<bool>,
    pub battery_status: Option<String>,
    pub output_load_watts: Option<f64>,
    pub output_load_va: Option<f64>,
    pub battery_capacity_percent: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub input_voltage: Option<f64>,
    pub input_frequency: Option<f64>,
    pub output_voltage: Option<f64>,
    pub output_frequency: Option<f64>,
    pub output_load_percent: Option<f64>,
    pub output_current_amps: Option<f64>,
    pub output_efficiency_percent: Option<f64>,
    pub output_energy_usage_kwh: Option<f64>,
    pub manufacture_date: Option<NaiveDate>,
    pub battery_last_replace_date: Option<NaiveDate>,
    pub battery_next_replace_date: Option<NaiveDate>,
    pub runtime_remaining_seconds: Option<u64>,
    pub on_battery_seconds: Option<u64>,
    pub sensors: Vec<SensorReading>,
    pub time: DateTime<Utc>,
}

impl Record {
    /// An empty snapshot for `name`: every measurement unknown.
    pub fn empty(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            model: None,
            sku: None,
            sensitivity: None,
            status: None,
            last_transfer_reason: None,
            battery_needs_replacement: None,
            battery_status: None,
            output_load_watts: None,
            output_load_va: None,
            battery_capacity_percent: None,
            battery_voltage: None,
            input_voltage: None,
            input_frequency: None,
            output_voltage: None,
            output_frequency: None,
            output_load_percent: None,
            output_current_amps: None,
            output_efficiency_percent: None,
            output_energy_usage_kwh: None,
            manufacture_date: None,
            battery_last_replace_date: None,
            battery_next_replace_date: None,
            runtime_remaining_seconds: None,
            on_battery_seconds: None,
            sensors: Vec::new(),
            time,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_target(name: &str) -> Target {
    Target {
        name: name.to_string(),
        address: "192.0.2.10".to_string(),
        overrides: DeviceOverrides::default(),
        snmp: SnmpCredentials::V2c {
            community: "public".to_string(),
        },
        snmp_port: 161,
        http: None,
        http_port: 80,
        fetch_probes: FetchProbes::Snmp,
        interval: None,
        timeout: None,
    }
}
