// Utilities for handling "load": the (host, time, value) samples that the reports chart.

use crate::dates::parse_local;
use crate::error::{Result, UsageError};
use crate::logfile::read_log_if_exists;
use crate::records::Schema;

use chrono::{NaiveDateTime, TimeZone};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub hostname: String,

    /// Wall-clock time in the zone the samples were loaded for.
    pub time: NaiveDateTime,

    pub value: f64,
}

/// Load the schema's value column from the log at `path` as samples, sorted ascending by host name
/// and then by time.  Rows without a usable timestamp, host name, or value are skipped; the
/// retention pass normally has removed them already.  A missing log yields no samples.

pub fn load_samples<Tz: TimeZone>(path: &Path, schema: &Schema, tz: &Tz) -> Result<Vec<Sample>> {
    let log = match read_log_if_exists(path)? {
        Some(log) => log,
        None => {
            tracing::warn!("No {} log at {:?}, reporting no samples", schema.name, path);
            return Ok(vec![]);
        }
    };

    let column = |name: &str| {
        log.column_index(name).ok_or_else(|| UsageError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
    };
    let time_ix = column("Timestamp")?;
    let host_ix = column("Hostname")?;
    let value_ix = column(schema.value_column)?;

    let mut samples = log
        .rows
        .iter()
        .filter_map(|row| {
            let time = parse_local(row.get(time_ix)?, tz)?.naive_local();
            let hostname = row.get(host_ix)?.trim();
            if hostname.is_empty() {
                return None;
            }
            let value = row.get(value_ix)?.trim().parse::<f64>().ok()?;
            if !value.is_finite() {
                return None;
            }
            Some(Sample {
                hostname: hostname.to_string(),
                time,
                value,
            })
        })
        .collect::<Vec<Sample>>();

    samples.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.time.cmp(&b.time)));
    tracing::debug!("Loaded {} samples from {:?}", samples.len(), path);
    Ok(samples)
}

#[cfg(test)]
use crate::records::{CPU_COLUMNS, CPU_SCHEMA, GPU_SCHEMA};
#[cfg(test)]
use chrono::{FixedOffset, Timelike};

#[test]
fn test_load_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_usage.csv");
    std::fs::write(
        &path,
        CPU_COLUMNS.join(",")
            + "\n"
            + "2024-03-01 10:05:00,ml2,40.0,1.00,0.50,0.25,2048,1024,512,,,,,,\n"
            + "2024-03-01 10:00:00,ml2,30.0,1.00,0.50,0.25,2048,1024,512,,,,,,\n"
            + "2024-03-01T01:00:00+00:00,ml1,20.0,1.00,0.50,0.25,2048,1024,512,,,,,,\n"
            + "2024-03-01 10:10:00,ml1,,1.00,0.50,0.25,2048,1024,512,,,,,,\n",
    )
    .unwrap();
    let tz = FixedOffset::east_opt(9 * 3600).unwrap();
    let samples = load_samples(&path, &CPU_SCHEMA, &tz).unwrap();
    assert!(samples.len() == 3);
    assert!(samples[0].hostname == "ml1");
    assert!(samples[0].value == 20.0);
    // Converted to local wall-clock time.
    assert!(samples[0].time.hour() == 10);
    assert!(samples[1].hostname == "ml2" && samples[1].value == 30.0);
    assert!(samples[2].hostname == "ml2" && samples[2].value == 40.0);
}

#[test]
fn test_load_samples_missing_log() {
    let dir = tempfile::tempdir().unwrap();
    let tz = FixedOffset::east_opt(0).unwrap();
    let samples = load_samples(&dir.path().join("gpu_usage.csv"), &GPU_SCHEMA, &tz).unwrap();
    assert!(samples.is_empty());
}
