//! Column layout of `p1.meter_readings` and the matching per-reading values
//!
//! Both the bound (`QueryBuilder`) and the literal (dry-run) renderings walk
//! [`reading_values`], so column order lives in exactly one place.

use chrono::{DateTime, Utc};
use sqlx::query_builder::Separated;
use sqlx::Postgres;
use std::fmt::Write as _;

use crate::models::Reading;

/// Columns written for every reading, in insert order
pub const READING_COLUMNS: [&str; 35] = [
    "unique_id",
    "created_at",
    "wifi_ssid",
    "wifi_strength",
    "smr_version",
    "meter_model",
    "active_tariff",
    "total_power_import_kwh",
    "total_power_import_t1_kwh",
    "total_power_import_t2_kwh",
    "total_power_export_kwh",
    "total_power_export_t1_kwh",
    "total_power_export_t2_kwh",
    "active_power_w",
    "active_power_l1_w",
    "active_power_l2_w",
    "active_power_l3_w",
    "active_voltage_l1_v",
    "active_voltage_l2_v",
    "active_voltage_l3_v",
    "active_current_a",
    "active_current_l1_a",
    "active_current_l2_a",
    "active_current_l3_a",
    "voltage_sag_l1_count",
    "voltage_sag_l2_count",
    "voltage_sag_l3_count",
    "voltage_swell_l1_count",
    "voltage_swell_l2_count",
    "voltage_swell_l3_count",
    "any_power_fail_count",
    "long_power_fail_count",
    "total_gas_m3",
    "gas_timestamp",
    "gas_unique_id",
];

/// Columns an upsert must never overwrite
const PRESERVED_ON_CONFLICT: [&str; 2] = ["unique_id", "created_at"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SqlValue<'a> {
    Text(&'a str),
    /// Empty strings are written as NULL
    NullableText(&'a str),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Timestamp(DateTime<Utc>),
}

impl SqlValue<'_> {
    pub(crate) fn push_bind(self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlValue::Text(v) => row.push_bind(v.to_string()),
            SqlValue::NullableText(v) => {
                row.push_bind((!v.is_empty()).then(|| v.to_string()))
            }
            SqlValue::Int4(v) => row.push_bind(v),
            SqlValue::Int8(v) => row.push_bind(v),
            SqlValue::Float8(v) => row.push_bind(v),
            SqlValue::Timestamp(v) => row.push_bind(v),
        };
    }

    fn write_literal(self, out: &mut String) {
        // writing into a String cannot fail
        let _ = match self {
            SqlValue::Text(v) => write!(out, "'{}'", v.replace('\'', "''")),
            SqlValue::NullableText("") => write!(out, "NULL"),
            SqlValue::NullableText(v) => write!(out, "'{}'", v.replace('\'', "''")),
            SqlValue::Int4(v) => write!(out, "{v}"),
            SqlValue::Int8(v) => write!(out, "{v}"),
            SqlValue::Float8(v) if v.is_finite() => write!(out, "{v}"),
            SqlValue::Float8(v) => write!(out, "'{v}'::float8"),
            SqlValue::Timestamp(v) => write!(out, "'{}'", v.format("%Y-%m-%d %H:%M:%S%:z")),
        };
    }
}

/// Values for one row, aligned with [`READING_COLUMNS`]
///
/// `stamp` is used as `created_at` when the reading has none.
pub(crate) fn reading_values(reading: &Reading, stamp: DateTime<Utc>) -> [SqlValue<'_>; 35] {
    use SqlValue::*;

    [
        NullableText(&reading.unique_id),
        Timestamp(reading.created_at.unwrap_or(stamp)),
        Text(&reading.wifi_ssid),
        Int4(reading.wifi_strength),
        Int4(reading.smr_version),
        Text(&reading.meter_model),
        Int4(reading.active_tariff),
        Float8(reading.total_power_import_kwh),
        Float8(reading.total_power_import_t1_kwh),
        Float8(reading.total_power_import_t2_kwh),
        Float8(reading.total_power_export_kwh),
        Float8(reading.total_power_export_t1_kwh),
        Float8(reading.total_power_export_t2_kwh),
        Float8(reading.active_power_w),
        Float8(reading.active_power_l1_w),
        Float8(reading.active_power_l2_w),
        Float8(reading.active_power_l3_w),
        Float8(reading.active_voltage_l1_v),
        Float8(reading.active_voltage_l2_v),
        Float8(reading.active_voltage_l3_v),
        Float8(reading.active_current_a),
        Float8(reading.active_current_l1_a),
        Float8(reading.active_current_l2_a),
        Float8(reading.active_current_l3_a),
        Int4(reading.voltage_sag_l1_count),
        Int4(reading.voltage_sag_l2_count),
        Int4(reading.voltage_sag_l3_count),
        Int4(reading.voltage_swell_l1_count),
        Int4(reading.voltage_swell_l2_count),
        Int4(reading.voltage_swell_l3_count),
        Int4(reading.any_power_fail_count),
        Int4(reading.long_power_fail_count),
        Float8(reading.total_gas_m3),
        Int8(reading.gas_timestamp),
        Text(&reading.gas_unique_id),
    ]
}

pub(crate) fn insert_prefix() -> String {
    format!(
        "INSERT INTO p1.meter_readings ({}) ",
        READING_COLUMNS.join(", ")
    )
}

/// `SET` list for the upsert: every column except the natural id and `created_at`
pub fn upsert_assignments() -> String {
    READING_COLUMNS
        .iter()
        .filter(|column| !PRESERVED_ON_CONFLICT.contains(*column))
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render a batch insert as one literal SQL statement for inspection
///
/// One value tuple per reading, a single trailing `;`. Empty input renders as
/// an empty string. Readings without `created_at` are stamped with the current
/// time, as the executed batch would be.
pub fn render_batch_sql(readings: &[Reading]) -> String {
    if readings.is_empty() {
        return String::new();
    }

    let stamp = Utc::now();
    let mut sql = insert_prefix();
    sql.push_str("VALUES\n");

    for (index, reading) in readings.iter().enumerate() {
        if index > 0 {
            sql.push_str(",\n");
        }
        sql.push('(');
        for (position, value) in reading_values(reading, stamp).into_iter().enumerate() {
            if position > 0 {
                sql.push_str(", ");
            }
            value.write_literal(&mut sql);
        }
        sql.push(')');
    }

    sql.push(';');
    sql
}
