//! Historical CSV import
//!
//! Reads the 15-minute exports `power-15m.csv` and `gas-15m.csv` from a data
//! directory, merges them row by row and groups the result per day so each
//! day can go through the batch insert path.
//!
//! ```text
//! power-15m.csv: time,Import T1 kWh,Import T2 kWh,Export T1 kWh,Export T2 kWh,L1 max W,L2 max W,L3 max W
//! gas-15m.csv:   time,Total gas used
//! ```
//!
//! Times are `YYYY-MM-DD HH:MM` in UTC. Row numbers in errors count the header
//! as row 1, matching what a spreadsheet shows.

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::Reading;
use crate::storage::render_batch_sql;

pub const POWER_FILE: &str = "power-15m.csv";
pub const GAS_FILE: &str = "gas-15m.csv";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";
const POWER_COLUMNS: usize = 8;
const GAS_COLUMNS: usize = 2;

/// Days rendered by a dry-run import
pub const DRY_RUN_DAYS: usize = 2;

#[derive(Debug, Error)]
pub enum CsvImportError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{file} is empty")]
    Empty { file: &'static str },

    #[error("{file} row {row} has {found} columns, expected {expected}")]
    Columns {
        file: &'static str,
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("{file} row {row}: invalid time '{value}'")]
    Time {
        file: &'static str,
        row: usize,
        value: String,
    },

    #[error("{file} row {row}: invalid number '{value}' in column '{column}'")]
    Number {
        file: &'static str,
        row: usize,
        column: &'static str,
        value: String,
    },

    #[error("power and gas CSV files have different number of records: {power} vs {gas}")]
    RowCount { power: usize, gas: usize },

    #[error("timestamp mismatch at row {row}: power={power}, gas={gas}")]
    TimestampMismatch {
        row: usize,
        power: DateTime<Utc>,
        gas: DateTime<Utc>,
    },
}

/// One 15-minute interval from both exports
#[derive(Debug, Clone, PartialEq)]
pub struct MergedReading {
    pub time: DateTime<Utc>,
    pub import_t1_kwh: f64,
    pub import_t2_kwh: f64,
    pub export_t1_kwh: f64,
    pub export_t2_kwh: f64,
    pub l1_max_w: f64,
    pub l2_max_w: f64,
    pub l3_max_w: f64,
    pub total_gas_m3: f64,
}

impl MergedReading {
    /// Map onto a reading; the per-phase maxima become active power per phase
    pub fn to_reading(&self) -> Reading {
        Reading {
            created_at: Some(self.time),
            total_power_import_t1_kwh: self.import_t1_kwh,
            total_power_import_t2_kwh: self.import_t2_kwh,
            total_power_export_t1_kwh: self.export_t1_kwh,
            total_power_export_t2_kwh: self.export_t2_kwh,
            active_power_l1_w: self.l1_max_w,
            active_power_l2_w: self.l2_max_w,
            active_power_l3_w: self.l3_max_w,
            total_gas_m3: self.total_gas_m3,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PowerRecord {
    time: DateTime<Utc>,
    values: [f64; POWER_COLUMNS - 1],
}

#[derive(Debug, Clone, PartialEq)]
struct GasRecord {
    time: DateTime<Utc>,
    total_gas_m3: f64,
}

/// Loader for one export directory
#[derive(Debug, Clone)]
pub struct CsvLoader {
    data_dir: PathBuf,
}

impl CsvLoader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Read both exports and merge them row by row
    pub fn load_and_merge(&self) -> Result<Vec<MergedReading>, CsvImportError> {
        let power = read_power(&self.data_dir.join(POWER_FILE))?;
        let gas = read_gas(&self.data_dir.join(GAS_FILE))?;

        if power.len() != gas.len() {
            return Err(CsvImportError::RowCount {
                power: power.len(),
                gas: gas.len(),
            });
        }

        power
            .into_iter()
            .zip(gas)
            .enumerate()
            .map(|(index, (power, gas))| {
                if power.time != gas.time {
                    return Err(CsvImportError::TimestampMismatch {
                        row: index + 1,
                        power: power.time,
                        gas: gas.time,
                    });
                }

                let [import_t1_kwh, import_t2_kwh, export_t1_kwh, export_t2_kwh, l1_max_w, l2_max_w, l3_max_w] =
                    power.values;

                Ok(MergedReading {
                    time: power.time,
                    import_t1_kwh,
                    import_t2_kwh,
                    export_t1_kwh,
                    export_t2_kwh,
                    l1_max_w,
                    l2_max_w,
                    l3_max_w,
                    total_gas_m3: gas.total_gas_m3,
                })
            })
            .collect()
    }
}

/// Group readings by UTC day (`YYYY-MM-DD`), days in ascending order
pub fn group_by_day(readings: &[MergedReading]) -> BTreeMap<String, Vec<MergedReading>> {
    let mut days: BTreeMap<String, Vec<MergedReading>> = BTreeMap::new();
    for reading in readings {
        days.entry(reading.time.format("%Y-%m-%d").to_string())
            .or_default()
            .push(reading.clone());
    }
    days
}

/// Batch SQL for the first `limit` days, for inspection without a database
pub fn dry_run_statements(
    days: &BTreeMap<String, Vec<MergedReading>>,
    limit: usize,
) -> Vec<(String, String)> {
    days.iter()
        .take(limit)
        .map(|(day, merged)| {
            let readings: Vec<Reading> = merged.iter().map(MergedReading::to_reading).collect();
            (day.clone(), render_batch_sql(&readings))
        })
        .collect()
}

fn read_rows(
    path: &Path,
    file: &'static str,
    expected: usize,
) -> Result<Vec<(usize, StringRecord)>, CsvImportError> {
    let read_error = |source| CsvImportError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(read_error)?;

    if reader.headers().map_err(read_error)?.is_empty() {
        return Err(CsvImportError::Empty { file });
    }

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(read_error)?;
        // header is row 1
        let row = index + 2;
        if record.len() != expected {
            return Err(CsvImportError::Columns {
                file,
                row,
                found: record.len(),
                expected,
            });
        }
        rows.push((row, record));
    }

    Ok(rows)
}

fn parse_time(file: &'static str, row: usize, value: &str) -> Result<DateTime<Utc>, CsvImportError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map(|time| time.and_utc())
        .map_err(|_| CsvImportError::Time {
            file,
            row,
            value: value.to_string(),
        })
}

fn parse_number(
    file: &'static str,
    row: usize,
    column: &'static str,
    value: &str,
) -> Result<f64, CsvImportError> {
    value.parse().map_err(|_| CsvImportError::Number {
        file,
        row,
        column,
        value: value.to_string(),
    })
}

fn read_power(path: &Path) -> Result<Vec<PowerRecord>, CsvImportError> {
    const NAMES: [&str; POWER_COLUMNS - 1] = [
        "Import T1 kWh",
        "Import T2 kWh",
        "Export T1 kWh",
        "Export T2 kWh",
        "L1 max W",
        "L2 max W",
        "L3 max W",
    ];

    read_rows(path, POWER_FILE, POWER_COLUMNS)?
        .into_iter()
        .map(|(row, record)| {
            let time = parse_time(POWER_FILE, row, &record[0])?;
            let mut values = [0.0; POWER_COLUMNS - 1];
            for (slot, (value, column)) in values.iter_mut().zip(record.iter().skip(1).zip(NAMES)) {
                *slot = parse_number(POWER_FILE, row, column, value)?;
            }
            Ok(PowerRecord { time, values })
        })
        .collect()
}

fn read_gas(path: &Path) -> Result<Vec<GasRecord>, CsvImportError> {
    read_rows(path, GAS_FILE, GAS_COLUMNS)?
        .into_iter()
        .map(|(row, record)| {
            Ok(GasRecord {
                time: parse_time(GAS_FILE, row, &record[0])?,
                total_gas_m3: parse_number(GAS_FILE, row, "Total gas used", &record[1])?,
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const POWER_HEADER: &str =
        "time,Import T1 kWh,Import T2 kWh,Export T1 kWh,Export T2 kWh,L1 max W,L2 max W,L3 max W";

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_read_power_csv() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            POWER_FILE,
            &format!(
                "{POWER_HEADER}\n\
                 2025-06-02 20:30,8293.146,7210.113,1916.077,4181.422,173,1212,67\n\
                 2025-06-02 20:45,8293.146,7210.236,1916.077,4181.422,127,48,77\n\
                 2025-06-02 21:00,8293.147,7210.276,1916.077,4181.422,93,56,78"
            ),
        );

        let records = read_power(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].time, at(2, 20, 30));
        assert_eq!(records[0].values[0], 8293.146);
        assert_eq!(records[0].values[4], 173.0);
    }

    #[test]
    fn test_read_gas_csv() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            GAS_FILE,
            "time,Total gas used\n2025-06-02 20:30,3488.524\n2025-06-02 20:45,3488.524\n2025-06-02 21:00,3488.600\n",
        );

        let records = read_gas(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].total_gas_m3, 3488.6);
    }

    fn write_pair(dir: &TempDir, gas_rows: &str) {
        write(
            dir,
            POWER_FILE,
            &format!(
                "{POWER_HEADER}\n\
                 2025-06-02 20:30,8293.146,7210.113,1916.077,4181.422,173,1212,67\n\
                 2025-06-02 20:45,8293.146,7210.236,1916.077,4181.422,127,48,77"
            ),
        );
        write(dir, GAS_FILE, &format!("time,Total gas used\n{gas_rows}"));
    }

    #[test]
    fn test_load_and_merge() {
        let dir = TempDir::new().unwrap();
        write_pair(&dir, "2025-06-02 20:30,3488.524\n2025-06-02 20:45,3488.530");

        let merged = CsvLoader::new(dir.path()).load_and_merge().unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].import_t1_kwh, 8293.146);
        assert_eq!(merged[0].l2_max_w, 1212.0);
        assert_eq!(merged[0].total_gas_m3, 3488.524);
        assert_eq!(merged[1].total_gas_m3, 3488.530);
    }

    #[test]
    fn test_merge_rejects_row_count_mismatch() {
        let dir = TempDir::new().unwrap();
        write_pair(&dir, "2025-06-02 20:30,3488.524");

        let err = CsvLoader::new(dir.path()).load_and_merge().unwrap_err();
        assert!(matches!(err, CsvImportError::RowCount { power: 2, gas: 1 }));
    }

    #[test]
    fn test_merge_rejects_misaligned_timestamps() {
        let dir = TempDir::new().unwrap();
        write_pair(&dir, "2025-06-02 20:30,3488.524\n2025-06-02 21:00,3488.530");

        let err = CsvLoader::new(dir.path()).load_and_merge().unwrap_err();
        assert!(matches!(err, CsvImportError::TimestampMismatch { row: 2, .. }));
    }

    #[test]
    fn test_to_reading() {
        let merged = MergedReading {
            time: at(2, 20, 30),
            import_t1_kwh: 8293.146,
            import_t2_kwh: 7210.113,
            export_t1_kwh: 1916.077,
            export_t2_kwh: 4181.422,
            l1_max_w: 173.0,
            l2_max_w: 1212.0,
            l3_max_w: 67.0,
            total_gas_m3: 3488.524,
        };

        let reading = merged.to_reading();
        assert_eq!(reading.created_at, Some(at(2, 20, 30)));
        assert_eq!(reading.total_power_import_t1_kwh, 8293.146);
        assert_eq!(reading.active_power_l1_w, 173.0);
        assert_eq!(reading.total_gas_m3, 3488.524);
        assert!(!reading.has_natural_id());
    }

    #[test]
    fn test_group_by_day_is_ordered() {
        let reading = |time| MergedReading {
            time,
            import_t1_kwh: 0.0,
            import_t2_kwh: 0.0,
            export_t1_kwh: 0.0,
            export_t2_kwh: 0.0,
            l1_max_w: 0.0,
            l2_max_w: 0.0,
            l3_max_w: 0.0,
            total_gas_m3: 0.0,
        };
        let readings = vec![
            reading(at(3, 10, 0)),
            reading(at(2, 20, 30)),
            reading(at(2, 21, 0)),
        ];

        let days = group_by_day(&readings);
        let keys: Vec<&str> = days.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["2025-06-02", "2025-06-03"]);
        assert_eq!(days["2025-06-02"].len(), 2);
        assert_eq!(days["2025-06-03"].len(), 1);

        let statements = dry_run_statements(&days, DRY_RUN_DAYS);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].1.lines().filter(|l| l.starts_with('(')).count(), 2);
        assert_eq!(dry_run_statements(&days, 1).len(), 1);
    }

    #[test]
    fn test_invalid_power_format() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            POWER_FILE,
            "time,Import T1 kWh,Import T2 kWh,Export T1 kWh,Export T2 kWh,L1 max W,L2 max W\n\
             2025-06-02 20:30,8293.146,7210.113,1916.077,4181.422,173,1212",
        );

        let err = read_power(&path).unwrap_err();
        assert!(matches!(
            err,
            CsvImportError::Columns { row: 2, found: 7, expected: 8, .. }
        ));
    }

    #[test]
    fn test_invalid_gas_format() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, GAS_FILE, "time\n2025-06-02 20:30");
        assert!(matches!(
            read_gas(&path).unwrap_err(),
            CsvImportError::Columns { .. }
        ));
    }

    #[test]
    fn test_invalid_number() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            POWER_FILE,
            &format!("{POWER_HEADER}\n2025-06-02 20:30,invalid,7210.113,1916.077,4181.422,173,1212,67"),
        );

        let err = read_power(&path).unwrap_err();
        assert!(matches!(
            err,
            CsvImportError::Number { column: "Import T1 kWh", row: 2, .. }
        ));
    }

    #[test]
    fn test_invalid_time() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, GAS_FILE, "time,Total gas used\n2025/06/02 20:30,3488.524");
        assert!(matches!(
            read_gas(&path).unwrap_err(),
            CsvImportError::Time { .. }
        ));
    }

    #[test]
    fn test_empty_csv() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, POWER_FILE, "");
        assert!(matches!(
            read_power(&path).unwrap_err(),
            CsvImportError::Empty { file: POWER_FILE }
        ));
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        let err = CsvLoader::new(dir.path()).load_and_merge().unwrap_err();
        assert!(matches!(err, CsvImportError::Read { .. }));
    }
}
