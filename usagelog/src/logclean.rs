// Retention pass over a usage log: drop invalid rows and rows that have aged out.
//
// A row is invalid if any of the schema's mandatory fields is null or does not parse as its kind
// (timestamp, number, non-blank text).  A valid row has aged out if its timestamp is older than
// `now` minus the retention window in calendar months.  The window is measured from the caller's
// wall-clock `now`, not from the newest row in the log, so a log that stops growing still empties
// out eventually.
//
// Naive timestamps are taken to be wall-clock time in `now`'s zone.
//
// The surviving rows are written back over the log as a whole; see `logfile::write_log` for the
// crash behavior.  The output is canonical CSV, so running the pass again with the same `now` and
// no new rows leaves the file byte-for-byte unchanged.

use crate::dates::{parse_local, retention_cutoff};
use crate::error::{Result, UsageError};
use crate::logfile::{read_log_if_exists, write_log, UsageLog};
use crate::records::{FieldKind, Schema, UsageRecord};

use chrono::{DateTime, TimeZone};
use std::path::Path;

pub const DEFAULT_RETENTION_MONTHS: u32 = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub kept: usize,
    pub invalid: usize,
    pub expired: usize,
}

/// Clean the log at `path` in place.  Returns None if there is no log to clean.

pub fn clean_logfile<Tz: TimeZone>(
    path: &Path,
    schema: &Schema,
    now: &DateTime<Tz>,
    retention_months: u32,
) -> Result<Option<CleanStats>> {
    let mut log = match read_log_if_exists(path)? {
        Some(log) => log,
        None => {
            tracing::warn!("No {} log at {:?}, nothing to clean", schema.name, path);
            return Ok(None);
        }
    };
    let stats = clean_log(&mut log, path, schema, now, retention_months)?;
    write_log(path, &log)?;
    tracing::info!(
        "Cleaned {:?}: kept {}, dropped {} invalid and {} expired",
        path,
        stats.kept,
        stats.invalid,
        stats.expired
    );
    Ok(Some(stats))
}

/// Filter the rows of `log` in place.  `path` is used only for error messages.

pub fn clean_log<Tz: TimeZone>(
    log: &mut UsageLog,
    path: &Path,
    schema: &Schema,
    now: &DateTime<Tz>,
    retention_months: u32,
) -> Result<CleanStats> {
    let mut mandatory = vec![];
    for (column, kind) in schema.mandatory {
        match log.column_index(column) {
            Some(ix) => mandatory.push((ix, *kind)),
            None => {
                return Err(UsageError::MissingColumn {
                    path: path.to_path_buf(),
                    column: column.to_string(),
                })
            }
        }
    }

    let tz = now.timezone();
    let cutoff = retention_cutoff(now, retention_months);
    if cutoff.is_none() {
        tracing::warn!(
            "No wall-clock time {} months before {:?}, {:?} will expire nothing",
            retention_months,
            now.naive_local(),
            path
        );
    }
    let mut stats = CleanStats::default();

    log.rows.retain(|row| match validate(row, &mandatory, &tz) {
        None => {
            stats.invalid += 1;
            false
        }
        Some(t) => {
            let fresh = match (&t, &cutoff) {
                (Some(t), Some(cutoff)) => t >= cutoff,
                _ => true,
            };
            if fresh {
                stats.kept += 1;
            } else {
                stats.expired += 1;
            }
            fresh
        }
    });

    Ok(stats)
}

// Returns None if the row is invalid, otherwise Some of the row's (first) timestamp, if the schema
// has one.
fn validate<Tz: TimeZone>(
    row: &UsageRecord,
    mandatory: &[(usize, FieldKind)],
    tz: &Tz,
) -> Option<Option<DateTime<Tz>>> {
    let mut timestamp = None;
    for (ix, kind) in mandatory {
        let value = row.get(*ix)?;
        match kind {
            FieldKind::Timestamp => {
                let t = parse_local(value, tz)?;
                if timestamp.is_none() {
                    timestamp = Some(t);
                }
            }
            FieldKind::Number => {
                let v = value.trim().parse::<f64>().ok()?;
                if !v.is_finite() {
                    return None;
                }
            }
            FieldKind::Text => {
                if value.trim().is_empty() {
                    return None;
                }
            }
        }
    }
    Some(timestamp)
}

#[cfg(test)]
use crate::records::{CPU_COLUMNS, CPU_SCHEMA, GPU_COLUMNS, GPU_SCHEMA};
#[cfg(test)]
use chrono::FixedOffset;
#[cfg(test)]
use std::fs;

#[cfg(test)]
fn tokyo_now(y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(9 * 3600)
        .unwrap()
        .with_ymd_and_hms(y, m, d, 0, 0, 0)
        .unwrap()
}

#[cfg(test)]
fn gpu_row(time: &str, host: &str, util: &str) -> String {
    format!("{time},{host},0,NVIDIA A100,50,150,250,2000,8192,{util}\n")
}

#[cfg(test)]
fn write_gpu_log(path: &Path, rows: &[String]) {
    let mut s = GPU_COLUMNS.join(",") + "\n";
    for r in rows {
        s += r;
    }
    fs::write(path, s).unwrap();
}

#[test]
fn test_retention_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    write_gpu_log(
        &path,
        &[
            gpu_row("2023-12-01 12:00:00", "ml1", "10"),
            gpu_row("2024-01-15 12:00:00", "ml1", "20"),
            gpu_row("2024-03-31 23:59:59", "ml2", "30"),
        ],
    );
    let now = tokyo_now(2024, 4, 1);
    let stats = clean_logfile(&path, &GPU_SCHEMA, &now, DEFAULT_RETENTION_MONTHS)
        .unwrap()
        .unwrap();
    assert!(stats == CleanStats { kept: 2, invalid: 0, expired: 1 });
    let log = crate::read_log(&path).unwrap();
    assert!(log.rows.len() == 2);
    assert!(log.rows[0].get(0) == Some("2024-01-15 12:00:00"));
    assert!(log.rows[1].get(0) == Some("2024-03-31 23:59:59"));
}

#[test]
fn test_retention_localizes() {
    // Cutoff is 2024-01-01 00:00 +09:00.  The zoned time is 05:00 on Jan 1 in Tokyo and is kept;
    // the same digits without a zone are taken as Tokyo time on Dec 31 and dropped.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    write_gpu_log(
        &path,
        &[
            gpu_row("2023-12-31T20:00:00+00:00", "ml1", "10"),
            gpu_row("2023-12-31 20:00:00", "ml1", "20"),
        ],
    );
    let stats = clean_logfile(&path, &GPU_SCHEMA, &tokyo_now(2024, 4, 1), 3)
        .unwrap()
        .unwrap();
    assert!(stats == CleanStats { kept: 1, invalid: 0, expired: 1 });
    let log = crate::read_log(&path).unwrap();
    assert!(log.rows[0].get(9) == Some("10"));
}

#[test]
fn test_drops_exactly_invalid_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    write_gpu_log(
        &path,
        &[
            gpu_row("2024-03-01 00:00:00", "ml1", "10"),
            gpu_row("", "ml1", "20"),
            gpu_row("2024-03-01 00:05:00", "ml1", ""),
            gpu_row("2024-03-01 00:10:00", "", "30"),
            gpu_row("not a time", "ml1", "40"),
            gpu_row("2024-03-01 00:15:00", "ml1", "[N/A]"),
            "2024-03-01 00:20:00,ml1\n".to_string(),
            gpu_row("2024-03-01 00:25:00", "ml2", "50"),
        ],
    );
    let stats = clean_logfile(&path, &GPU_SCHEMA, &tokyo_now(2024, 4, 1), 3)
        .unwrap()
        .unwrap();
    assert!(stats == CleanStats { kept: 2, invalid: 6, expired: 0 });
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        GPU_COLUMNS.join(",")
            + "\n"
            + &gpu_row("2024-03-01 00:00:00", "ml1", "10")
            + &gpu_row("2024-03-01 00:25:00", "ml2", "50")
    );
}

#[test]
fn test_cpu_rows_with_null_user_slots_survive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_usage.csv");
    fs::write(
        &path,
        CPU_COLUMNS.join(",")
            + "\n"
            + "2024-03-01 00:00:00,ml1,12.5,1.00,0.50,0.25,2048,1024,512,bob,45.0,,,,\n"
            + "2024-03-01 00:05:00,ml1,,1.00,0.50,0.25,2048,1024,512,bob,45.0,,,,\n",
    )
    .unwrap();
    let stats = clean_logfile(&path, &CPU_SCHEMA, &tokyo_now(2024, 4, 1), 3)
        .unwrap()
        .unwrap();
    assert!(stats == CleanStats { kept: 1, invalid: 1, expired: 0 });
}

#[test]
fn test_clean_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    write_gpu_log(
        &path,
        &[
            gpu_row("2023-06-01 00:00:00", "ml1", "10"),
            gpu_row("\"2024-03-01 00:00:00\"", "ml1", "20"),
            gpu_row("2024-03-02 00:00:00", "ml1", ""),
        ],
    );
    let now = tokyo_now(2024, 4, 1);
    clean_logfile(&path, &GPU_SCHEMA, &now, 3).unwrap();
    let first = fs::read(&path).unwrap();
    let stats = clean_logfile(&path, &GPU_SCHEMA, &now, 3).unwrap().unwrap();
    assert!(stats == CleanStats { kept: 1, invalid: 0, expired: 0 });
    assert!(fs::read(&path).unwrap() == first);
}

#[test]
fn test_missing_column() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    fs::write(&path, "Timestamp,Hostname\n2024-03-01 00:00:00,ml1\n").unwrap();
    let r = clean_logfile(&path, &GPU_SCHEMA, &tokyo_now(2024, 4, 1), 3);
    assert!(matches!(r, Err(UsageError::MissingColumn { .. })));
    // The file is untouched.
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "Timestamp,Hostname\n2024-03-01 00:00:00,ml1\n"
    );
}

#[test]
fn test_missing_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    assert!(clean_logfile(&path, &GPU_SCHEMA, &tokyo_now(2024, 4, 1), 3)
        .unwrap()
        .is_none());
    assert!(!path.exists());
}

#[test]
fn test_retention_without_cutoff_keeps_rows() {
    use chrono_tz::Europe::Oslo;
    // Four months before 2024-07-31 02:30 is 2024-03-31 02:30, inside Oslo's spring-forward gap.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    write_gpu_log(
        &path,
        &[
            gpu_row("2020-01-01 00:00:00", "ml1", "10"),
            gpu_row("2024-07-30 12:00:00", "ml1", ""),
            gpu_row("2024-07-30 12:00:00", "ml1", "20"),
        ],
    );
    let now = Oslo.with_ymd_and_hms(2024, 7, 31, 2, 30, 0).unwrap();
    let stats = clean_logfile(&path, &GPU_SCHEMA, &now, 4).unwrap().unwrap();
    assert!(stats == CleanStats { kept: 2, invalid: 1, expired: 0 });

    // One day later the cutoff exists again and the old row goes.
    let now = Oslo.with_ymd_and_hms(2024, 8, 1, 2, 30, 0).unwrap();
    let stats = clean_logfile(&path, &GPU_SCHEMA, &now, 4).unwrap().unwrap();
    assert!(stats == CleanStats { kept: 1, invalid: 0, expired: 1 });
}
