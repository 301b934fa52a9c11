//! ClickHouse sink implementation.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use super::models::Record;

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Network trouble or an overloaded server; the insert may be retried.
    #[error("transient insert failure: {0}")]
    Transient(String),
    /// Rejected by the server (schema, auth, bad request); retrying won't help.
    #[error("fatal insert failure: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Write endpoint for batches of records.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn insert(&self, table: &str, batch: &[Record]) -> Result<(), SinkError>;
}

/// Connection parameters for the ClickHouse HTTP interface.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Inserts records through ClickHouse's HTTP interface as `JSONEachRow`.
pub struct ClickHouseSink {
    client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SinkError::Fatal(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn insert(&self, table: &str, batch: &[Record]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let query = format!("INSERT INTO {} FORMAT JSONEachRow", table);
        let response = self
            .client
            .post(&self.config.url)
            .query(&[
                ("database", self.config.database.as_str()),
                ("query", query.as_str()),
            ])
            .basic_auth(&self.config.user, Some(&self.config.password))
            .body(encode_rows(batch))
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    SinkError::Fatal(e.to_string())
                } else {
                    SinkError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status, body.trim());
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SinkError::Transient(message))
        } else {
            Err(SinkError::Fatal(message))
        }
    }
}

/// Encode a batch as newline-delimited JSON rows.
fn encode_rows(batch: &[Record]) -> String {
    let mut body = String::new();
    for record in batch {
        body.push_str(&to_row(record).to_string());
        body.push('\n');
    }
    body
}

/// Map a record onto the table's columns.
///
/// Sensors become the parallel `sensor_name`/`sensor_value` arrays.
fn to_row(record: &Record) -> Value {
    let date = |d: Option<chrono::NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string());
    json!({
        "name": record.name,
        "model": record.model,
        "sku": record.sku,
        "sensitivity": record.sensitivity,
        "status": record.status,
        "last_transfer_reason": record.last_transfer_reason,
        "battery_needs_replacement": record.battery_needs_replacement,
        "battery_status": record.battery_status,
        "output_load_watts": record.output_load_watts,
        "output_load_va": record.output_load_va,
        "battery_capacity_percent": record.battery_capacity_percent,
        "battery_voltage": record.battery_voltage,
        "input_voltage": record.input_voltage,
        "input_frequency": record.input_frequency,
        "output_voltage": record.output_voltage,
        "output_frequency": record.output_frequency,
        "output_load_percent": record.output_load_percent,
        "output_current_amps": record.output_current_amps,
        "output_efficiency_percent": record.output_efficiency_percent,
        "output_energy_usage_kwh": record.output_energy_usage_kwh,
        "manufacture_date": date(record.manufacture_date),
        "battery_last_replace_date": date(record.battery_last_replace_date),
        "battery_next_replace_date": date(record.battery_next_replace_date),
        "runtime_remaining_seconds": record.runtime_remaining_seconds,
        "on_battery_seconds": record.on_battery_seconds,
        "sensor_name": record.sensors.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "sensor_value": record.sensors.iter().map(|s| s.value).collect::<Vec<_>>(),
        "time": record.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SensorReading;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_to_row() {
        let time = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 5).unwrap();
        let mut record = Record::empty("ups-core-1", time);
        record.model = Some("Smart-UPS X 2200".to_string());
        record.battery_voltage = Some(133.0);
        record.manufacture_date = NaiveDate::from_ymd_opt(2022, 3, 7);
        record.sensors = vec![
            SensorReading::new("Battery Temperature", 20.6),
            SensorReading::new("Rack Front Humidity", 41.0),
        ];

        let row = to_row(&record);
        assert_eq!(row["name"], "ups-core-1");
        assert_eq!(row["model"], "Smart-UPS X 2200");
        assert_eq!(row["battery_voltage"], 133.0);
        assert!(row["input_voltage"].is_null());
        assert_eq!(row["manufacture_date"], "2022-03-07");
        assert_eq!(row["sensor_name"], json!(["Battery Temperature", "Rack Front Humidity"]));
        assert_eq!(row["sensor_value"], json!([20.6, 41.0]));
        assert_eq!(row["time"], "2024-06-01 12:30:05.000");
    }

    #[test]
    fn test_encode_rows_one_line_per_record() {
        let batch = vec![
            Record::empty("a", Utc::now()),
            Record::empty("b", Utc::now()),
        ];
        let body = encode_rows(&batch);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["name"], "a");
    }

    #[tokio::test]
    async fn test_insert_unreachable_is_transient() {
        let sink = ClickHouseSink::new(ClickHouseConfig {
            url: "http://127.0.0.1:1".to_string(),
            user: "default".to_string(),
            password: String::new(),
            database: "default".to_string(),
        })
        .unwrap();

        let batch = vec![Record::empty("ups", Utc::now())];
        let err = sink.insert("apc_ups", &batch).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
