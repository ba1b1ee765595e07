//! Meter reading models
//!
//! `Reading` mirrors one row of `p1.meter_readings`; `ExternalReading` one row
//! of `p1.external_readings`.
//!
//! Deserialization is lenient per field: `null` or a value of the wrong JSON
//! type becomes zero/empty instead of rejecting the whole snapshot, and
//! whole-valued floats are accepted in integer columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One flattened meter snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(default)]
pub struct Reading {
    /// Natural identifier assigned by the meter. Empty for CSV-imported rows.
    #[serde(deserialize_with = "lenient::text")]
    pub unique_id: String,
    /// Stamped with the current time on persist when unset.
    #[serde(skip_deserializing)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient::text")]
    pub wifi_ssid: String,
    #[serde(deserialize_with = "lenient::int")]
    pub wifi_strength: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub smr_version: i32,
    #[serde(deserialize_with = "lenient::text")]
    pub meter_model: String,
    #[serde(deserialize_with = "lenient::int")]
    pub active_tariff: i32,
    #[serde(deserialize_with = "lenient::float")]
    pub total_power_import_kwh: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub total_power_import_t1_kwh: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub total_power_import_t2_kwh: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub total_power_export_kwh: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub total_power_export_t1_kwh: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub total_power_export_t2_kwh: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_power_w: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_power_l1_w: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_power_l2_w: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_power_l3_w: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_voltage_l1_v: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_voltage_l2_v: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_voltage_l3_v: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_current_a: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_current_l1_a: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_current_l2_a: f64,
    #[serde(deserialize_with = "lenient::float")]
    pub active_current_l3_a: f64,
    #[serde(deserialize_with = "lenient::int")]
    pub voltage_sag_l1_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub voltage_sag_l2_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub voltage_sag_l3_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub voltage_swell_l1_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub voltage_swell_l2_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub voltage_swell_l3_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub any_power_fail_count: i32,
    #[serde(deserialize_with = "lenient::int")]
    pub long_power_fail_count: i32,
    #[serde(deserialize_with = "lenient::float")]
    pub total_gas_m3: f64,
    #[serde(deserialize_with = "lenient::int")]
    pub gas_timestamp: i64,
    #[serde(deserialize_with = "lenient::text")]
    pub gas_unique_id: String,
}

impl Reading {
    /// Whether this reading carries a natural identifier usable for upserts
    pub fn has_natural_id(&self) -> bool {
        !self.unique_id.is_empty()
    }
}

/// A secondary measurement (gas, water, heat) reported alongside a reading
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(default)]
pub struct ExternalReading {
    #[serde(deserialize_with = "lenient::text")]
    pub unique_id: String,
    #[serde(rename = "type", deserialize_with = "lenient::text")]
    #[sqlx(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "lenient::int")]
    pub timestamp: i64,
    #[serde(deserialize_with = "lenient::float")]
    pub value: f64,
    #[serde(deserialize_with = "lenient::text")]
    pub unit: String,
}

/// A parsed payload: the reading and the external readings it owns
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedReading {
    pub reading: Reading,
    pub externals: Vec<ExternalReading>,
}

/// Field deserializers that fall back to the default instead of failing
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn float<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Value::deserialize(deserializer)?.as_f64().unwrap_or_default())
    }

    /// Integers, truncating floats; out-of-range values become zero
    pub fn int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<i64> + Default,
    {
        let value = Value::deserialize(deserializer)?;
        let whole = value.as_i64().or_else(|| {
            value
                .as_f64()
                .filter(|v| v.is_finite() && v.abs() < i64::MAX as f64)
                .map(|v| v.trunc() as i64)
        });

        Ok(whole
            .and_then(|v| T::try_from(v).ok())
            .unwrap_or_default())
    }

    pub fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            _ => String::new(),
        })
    }

    /// `null` as the default, anything else deserialized normally
    pub fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_null_fields_become_defaults() {
        let reading: Reading = serde_json::from_str(
            r#"{"unique_id": "abc", "gas_unique_id": null, "total_gas_m3": null, "active_tariff": null}"#,
        )
        .unwrap();

        assert_eq!(reading.unique_id, "abc");
        assert_eq!(reading.gas_unique_id, "");
        assert_eq!(reading.total_gas_m3, 0.0);
        assert_eq!(reading.active_tariff, 0);
    }

    #[test]
    fn test_integer_columns_accept_floats() {
        let reading: Reading = serde_json::from_str(
            r#"{"active_tariff": 2.0, "voltage_sag_l1_count": 3.7, "gas_timestamp": 250602203000.0}"#,
        )
        .unwrap();

        assert_eq!(reading.active_tariff, 2);
        assert_eq!(reading.voltage_sag_l1_count, 3);
        assert_eq!(reading.gas_timestamp, 250602203000);
    }

    #[test]
    fn test_wrong_types_become_defaults() {
        let reading: Reading = serde_json::from_str(
            r#"{"wifi_strength": "strong", "active_power_w": "412", "meter_model": 42, "smr_version": 1e12}"#,
        )
        .unwrap();

        assert_eq!(reading.wifi_strength, 0);
        assert_eq!(reading.active_power_w, 0.0);
        assert_eq!(reading.meter_model, "");
        // does not fit in an i32
        assert_eq!(reading.smr_version, 0);
    }

    #[test]
    fn test_external_reading_is_lenient() {
        let external: ExternalReading = serde_json::from_str(
            r#"{"unique_id": null, "type": "gas_meter", "timestamp": 1.0, "value": 3, "unit": null}"#,
        )
        .unwrap();

        assert_eq!(external.kind, "gas_meter");
        assert_eq!(external.timestamp, 1);
        assert_eq!(external.value, 3.0);
        assert_eq!(external.unit, "");
    }
}
