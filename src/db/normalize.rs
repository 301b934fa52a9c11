//! Conversion of raw device fields into records.

use chrono::{DateTime, NaiveDate, Utc};

use super::models::{DeviceOverrides, Record, SensorReading};
use crate::probe::FieldMap;

impl Record {
    /// Build a record from the fields a device reported.
    ///
    /// Unknown keys are ignored and missing or unparseable values stay `None`.
    /// Overrides only fill in values the device did not report.
    pub fn from_fields(
        name: &str,
        fields: &FieldMap,
        overrides: &DeviceOverrides,
        time: DateTime<Utc>,
    ) -> Self {
        let mut record = Record::empty(name, time);

        record.model = text(fields, "upsBasicIdentModel.0");
        record.sku = text(fields, "upsAdvIdentSkuNumber.0").or_else(|| overrides.sku.clone());
        record.sensitivity = text(fields, "upsAdvConfigSensitivity.0");
        record.status = text(fields, "upsBasicOutputStatus.0");
        record.last_transfer_reason = text(fields, "upsAdvInputLineFailCause.0");
        record.battery_needs_replacement = fields
            .get("upsAdvBatteryReplaceIndicator.0")
            .map(|v| v == "batteryNeedsReplacing" || v == "2");
        record.battery_status = text(fields, "upsBasicBatteryStatus.0");

        // Load is reported in tenths of a percent.
        let load_fraction = scaled(fields, "upsHighPrecOutputLoad.0", 1000.0);
        record.output_load_watts = scaled(fields, "upsAdvOutputActivePower.0", 1.0).or_else(|| {
            rated_share(overrides.rated_watts, load_fraction)
        });
        record.output_load_va = scaled(fields, "upsAdvOutputApparentPower.0", 1.0)
            .or_else(|| rated_share(overrides.rated_va, load_fraction));

        record.battery_capacity_percent = scaled(fields, "upsHighPrecBatteryCapacity.0", 10.0);
        record.battery_voltage = scaled(fields, "upsHighPrecBatteryActualVoltage.0", 10.0);
        record.input_voltage = scaled(fields, "upsHighPrecInputLineVoltage.0", 10.0);
        record.input_frequency = scaled(fields, "upsHighPrecInputFrequency.0", 10.0);
        record.output_voltage = scaled(fields, "upsHighPrecOutputVoltage.0", 10.0);
        record.output_frequency = scaled(fields, "upsHighPrecOutputFrequency.0", 10.0);
        record.output_load_percent = scaled(fields, "upsHighPrecOutputLoad.0", 10.0);
        record.output_current_amps = scaled(fields, "upsHighPrecOutputCurrent.0", 10.0);
        // Negative values are status codes (load too low, not available).
        record.output_efficiency_percent =
            scaled(fields, "upsHighPrecOutputEfficiency.0", 10.0).map(|v| v.max(0.0));
        record.output_energy_usage_kwh = scaled(fields, "upsHighPrecOutputEnergyUsage.0", 100.0);

        record.manufacture_date = date(fields, "upsAdvIdentDateOfManufacture.0");
        record.battery_last_replace_date = date(fields, "upsBasicBatteryLastReplaceDate.0");
        record.battery_next_replace_date = date(fields, "upsAdvBatteryRecommendedReplaceDate.0");

        record.runtime_remaining_seconds = duration(fields, "upsAdvBatteryRunTimeRemaining.0");
        record.on_battery_seconds = duration(fields, "upsBasicBatteryTimeOnBattery.0");

        record.sensors = sensors(fields);
        record
    }
}

fn text(fields: &FieldMap, key: &str) -> Option<String> {
    fields.get(key).map(str::to_string)
}

fn scaled(fields: &FieldMap, key: &str, divisor: f64) -> Option<f64> {
    let raw = fields.get(key)?;
    match raw.trim().parse::<f64>() {
        Ok(v) => Some(v / divisor),
        Err(_) => {
            tracing::debug!("Ignoring non-numeric {} {:?}", key, raw);
            None
        }
    }
}

fn rated_share(rated: Option<u32>, load_fraction: Option<f64>) -> Option<f64> {
    Some(f64::from(rated?) * load_fraction?)
}

/// Parse `MM/DD/YYYY` or `MM/DD/YY`.
fn date(fields: &FieldMap, key: &str) -> Option<NaiveDate> {
    let raw = fields.get(key)?.trim();
    let (first, second) = if raw.len() > 8 {
        ("%m/%d/%Y", "%m/%d/%y")
    } else {
        ("%m/%d/%y", "%m/%d/%Y")
    };
    let parsed = NaiveDate::parse_from_str(raw, first)
        .or_else(|_| NaiveDate::parse_from_str(raw, second))
        .ok();
    if parsed.is_none() {
        tracing::warn!("Failed to parse {} {:?}", key, raw);
    }
    parsed
}

/// Parse a TimeTicks value into whole seconds.
///
/// Accepts the formatted `days:hours:minutes:seconds.hundredths` form as well
/// as raw hundredths of a second.
fn duration(fields: &FieldMap, key: &str) -> Option<u64> {
    let raw = fields.get(key)?.trim();
    if let Ok(ticks) = raw.parse::<u64>() {
        return Some(ticks / 100);
    }

    let parts: Vec<&str> = raw.split(':').collect();
    let [days, hours, minutes, seconds] = parts.as_slice() else {
        tracing::warn!("Failed to parse {} {:?}", key, raw);
        return None;
    };
    let whole_seconds = seconds.split('.').next().unwrap_or_default();
    let parsed = (|| -> Option<u64> {
        days.parse::<u64>()
            .ok()?
            .checked_mul(86_400)?
            .checked_add(hours.parse::<u64>().ok()?.checked_mul(3_600)?)?
            .checked_add(minutes.parse::<u64>().ok()?.checked_mul(60)?)?
            .checked_add(whole_seconds.parse::<u64>().ok()?)
    })();
    if parsed.is_none() {
        tracing::warn!("Failed to parse {} {:?}", key, raw);
    }
    parsed
}

/// Collect the battery temperature and any external sensor probes.
fn sensors(fields: &FieldMap) -> Vec<SensorReading> {
    let mut sensors = Vec::new();

    if let Some(temp) = scaled(fields, "upsHighPrecExtdBatteryTemperature.0", 10.0) {
        sensors.push(SensorReading::new("Battery Temperature", temp));
    }

    let mut probes: Vec<(&str, &str)> = fields.indexed("uioSensorStatusSensorName").collect();
    probes.sort_by_key(|(index, _)| index_key(index));

    for (index, name) in probes {
        let reading = |prefix: &str| {
            let key = format!("{}.{}", prefix, index);
            scaled(fields, &key, 1.0)
        };
        if let Some(temp) = reading("uioSensorStatusTemperatureDegC") {
            sensors.push(SensorReading::new(format!("{} Temperature", name), temp));
        }
        if let Some(humidity) = reading("uioSensorStatusHumidity") {
            sensors.push(SensorReading::new(format!("{} Humidity", name), humidity));
        }
    }

    sensors
}

fn index_key(index: &str) -> Vec<u64> {
    index
        .split('.')
        .map(|part| part.parse().unwrap_or(u64::MAX))
        .collect()
}
