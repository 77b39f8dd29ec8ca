// Reading and rewriting whole usage logs.
//
// A log is read into memory as its header plus its rows, each row a UsageRecord with exactly one
// field per header column.  Reading is forgiving in the same way the monitors are: a line that
// fails to decode (bad quoting, bad UTF8) or that has more fields than the header is dropped with
// a warning, and a short line is padded with nulls so that the validity filter can judge it.
// Only I/O errors are propagated.
//
// NOTE: There's an assumption here that the CSV decoder will make progress to the end of the
// record on a decoding error, as CSV is line-oriented.

use crate::error::{Result, UsageError};
use crate::logstore::csv_writer;
use crate::records::UsageRecord;

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::iter;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageLog {
    pub columns: Vec<String>,
    pub rows: Vec<UsageRecord>,
}

impl UsageLog {
    /// An empty log with the given header.

    pub fn with_columns(columns: &[&str]) -> UsageLog {
        UsageLog {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: vec![],
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Read the log at `path`.  The file must exist.

pub fn read_log(path: &Path) -> Result<UsageLog> {
    let file = File::open(path).map_err(|e| UsageError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let columns = reader
        .headers()
        .map_err(|e| UsageError::csv(path, e))?
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<String>>();
    let ncols = columns.len();

    let mut rows = vec![];
    for record in reader.records() {
        match record {
            Err(e) => {
                if e.is_io_error() {
                    return Err(UsageError::csv(path, e));
                }
                tracing::warn!("{:?}: skipping malformed line: {}", path, e);
            }
            Ok(record) => {
                if record.len() > ncols {
                    tracing::warn!(
                        "{:?}: skipping line {}: expected {} fields, saw {}",
                        path,
                        record.position().map(|p| p.line()).unwrap_or_default(),
                        ncols,
                        record.len()
                    );
                    continue;
                }
                let padding = ncols - record.len();
                rows.push(UsageRecord::from_fields(
                    record.iter().chain(iter::repeat("").take(padding)),
                ));
            }
        }
    }

    Ok(UsageLog { columns, rows })
}

/// Read the log at `path`, or return None if there is no such file.

pub fn read_log_if_exists(path: &Path) -> Result<Option<UsageLog>> {
    if !path.exists() {
        return Ok(None);
    }
    read_log(path).map(Some)
}

/// Replace the file at `path` with `log`, header first.

pub fn write_log(path: &Path, log: &UsageLog) -> Result<()> {
    let mut writer = csv_writer(vec![]);
    writer
        .write_record(&log.columns)
        .map_err(|e| UsageError::csv(path, e))?;
    for row in &log.rows {
        writer
            .write_record(row.csv_fields())
            .map_err(|e| UsageError::csv(path, e))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| UsageError::io(path, e.into_error()))?;
    replace_contents(path, &bytes)
}

/// Replace the contents of the file at `path` by writing a temporary file next to it and renaming
/// it into place.  A crash leaves either the old or the new file, never a torn one.  The old file's
/// permissions are carried over.

pub(crate) fn replace_contents(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| UsageError::io(path, e))?;
    tmp.write_all(contents)
        .map_err(|e| UsageError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| UsageError::io(path, e))?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(|e| UsageError::io(path, e))?;
    }
    tmp.persist(path)
        .map_err(|e| UsageError::io(path, e.error))?;
    Ok(())
}

#[test]
fn test_read_log_forgiving() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    let mut contents = b"A,B,C\n1,2,3\n4,5\n6,7,8,9\n".to_vec();
    contents.extend_from_slice(b"\xff\xfe,x,y\n10,11,12\n");
    fs::write(&path, contents).unwrap();

    let log = read_log(&path).unwrap();
    assert!(log.columns == vec!["A", "B", "C"]);
    // The short row is padded, the long row and the bad UTF8 row are dropped.
    assert!(log.rows.len() == 3);
    assert!(log.rows[0] == UsageRecord::from_fields(vec!["1", "2", "3"]));
    assert!(log.rows[1].len() == 3);
    assert!(log.rows[1].get(2).is_none());
    assert!(log.rows[2] == UsageRecord::from_fields(vec!["10", "11", "12"]));
}

#[test]
fn test_read_log_missing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.csv");
    assert!(matches!(read_log(&path), Err(UsageError::Io { .. })));
    assert!(read_log_if_exists(&path).unwrap().is_none());
}

#[test]
fn test_write_log_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    fs::write(&path, "junk\n").unwrap();
    let mut log = UsageLog::with_columns(&["A", "B"]);
    log.rows.push(UsageRecord::from_fields(vec!["1", ""]));
    write_log(&path, &log).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "A,B\n1,\n");
    assert!(read_log(&path).unwrap() == log);

    // No temporary files are left behind.
    assert!(fs::read_dir(dir.path()).unwrap().count() == 1);
}
