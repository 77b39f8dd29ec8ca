// Append-only CSV log files whose first row names the columns.
//
// The header is repaired lazily: before every append the first row is compared to the expected
// columns and, if it differs or is missing, only the header is rewritten.  Data rows are kept
// byte-for-byte.  This lets the column set evolve without losing history, at the price of never
// noticing an accidental schema change (other than by a warning in the log).
//
// There is no locking.  Two monitors appending to the same file at the same time may interleave
// their rows; scheduling must serialize them.

use crate::error::{Result, UsageError};
use crate::records::UsageRecord;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Make sure the log at `path` exists and that its first row is exactly `columns`.
///
/// A missing file is created holding just the header.  An empty file, or one whose first row
/// differs from `columns`, gets its header replaced; everything after the first row is kept
/// unchanged.

pub fn ensure_schema(path: &Path, columns: &[&str]) -> Result<()> {
    if !path.exists() {
        let mut file = File::create(path).map_err(|e| UsageError::io(path, e))?;
        file.write_all(&header_bytes(path, columns)?)
            .map_err(|e| UsageError::io(path, e))?;
        return Ok(());
    }

    let contents = fs::read(path).map_err(|e| UsageError::io(path, e))?;
    let (first_row, data_start) = {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(contents.as_slice());
        let mut first = csv::ByteRecord::new();
        match reader.read_byte_record(&mut first) {
            Ok(true) => (Some(first), reader.position().byte() as usize),
            Ok(false) => (None, contents.len()),
            // A first row that will not even decode is as good as missing, but we can't know where
            // it ends, so take the first line.
            Err(_) => {
                let end = contents
                    .iter()
                    .position(|b| *b == b'\n')
                    .map(|p| p + 1)
                    .unwrap_or(contents.len());
                (None, end)
            }
        }
    };

    let matches = match first_row {
        Some(ref row) => row.len() == columns.len()
            && row.iter().zip(columns.iter()).all(|(a, b)| a == b.as_bytes()),
        None => false,
    };
    if matches {
        return Ok(());
    }

    tracing::warn!(
        "Log {:?} header does not match the {}-column schema, rewriting header",
        path,
        columns.len()
    );
    let mut rest = &contents[data_start.min(contents.len())..];
    // The reader stops after the \r of a \r\n pair.
    if data_start > 0 && contents[data_start - 1] == b'\r' && rest.first() == Some(&b'\n') {
        rest = &rest[1..];
    }
    let mut repaired = header_bytes(path, columns)?;
    repaired.extend_from_slice(rest);
    crate::logfile::replace_contents(path, &repaired)
}

/// Append one record.  The record must have exactly one field per column; if it does not, nothing
/// is written and RecordLength is returned.

pub fn append(path: &Path, columns: &[&str], record: &UsageRecord) -> Result<()> {
    append_all(path, columns, std::slice::from_ref(record))
}

/// Append a batch of records after a single schema check.  Every record is checked before the
/// file is touched, so a bad record means no rows are written.

pub fn append_all(path: &Path, columns: &[&str], records: &[UsageRecord]) -> Result<()> {
    for record in records {
        if record.len() != columns.len() {
            return Err(UsageError::RecordLength {
                expected: columns.len(),
                found: record.len(),
            });
        }
    }

    ensure_schema(path, columns)?;

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| UsageError::io(path, e))?;

    // A file edited by hand may lack the final newline; don't glue our row onto its last one.
    if !ends_with_newline(&mut file).map_err(|e| UsageError::io(path, e))? {
        file.write_all(b"\n").map_err(|e| UsageError::io(path, e))?;
    }

    let mut writer = csv_writer(file);
    for record in records {
        writer
            .write_record(record.csv_fields())
            .map_err(|e| UsageError::csv(path, e))?;
    }
    writer.flush().map_err(|e| UsageError::io(path, e))?;
    Ok(())
}

/// A CSV writer with the settings used for all log output.

pub fn csv_writer<W: Write>(w: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(w)
}

fn header_bytes(path: &Path, columns: &[&str]) -> Result<Vec<u8>> {
    let mut writer = csv_writer(vec![]);
    writer
        .write_record(columns)
        .map_err(|e| UsageError::csv(path, e))?;
    writer
        .into_inner()
        .map_err(|e| UsageError::io(path, e.into_error()))
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
fn read_rows(path: &Path) -> Vec<Vec<String>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .unwrap()
        .records()
        .map(|r| r.unwrap().iter().map(|f| f.to_string()).collect())
        .collect()
}

#[test]
fn test_append_creates_file_with_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    let columns = ["Timestamp", "Hostname", "Value"];
    let record = UsageRecord::new()
        .field("2024-01-01 00:00:00")
        .field("ml1")
        .field("1.5");
    append(&path, &columns, &record).unwrap();
    let rows = read_rows(&path);
    assert!(rows.len() == 2);
    assert!(rows[0] == columns);
    assert!(rows[1] == vec!["2024-01-01 00:00:00", "ml1", "1.5"]);
}

#[test]
fn test_append_keeps_correct_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    let columns = ["Timestamp", "Hostname", "Value"];
    fs::write(&path, "Timestamp,Hostname,Value\n2024-01-01 00:00:00,ml1,1.5\n").unwrap();
    let record = UsageRecord::new()
        .field("2024-01-01 00:05:00")
        .field("ml1, the big one")
        .maybe::<f64>(None);
    append(&path, &columns, &record).unwrap();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "Timestamp,Hostname,Value\n2024-01-01 00:00:00,ml1,1.5\n2024-01-01 00:05:00,\"ml1, the big one\",\n"
    );
    let rows = read_rows(&path);
    assert!(rows[2] == vec!["2024-01-01 00:05:00", "ml1, the big one", ""]);
}

#[test]
fn test_ensure_schema_rewrites_only_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    let data = "2024-01-01 00:00:00,ml1,1.5\n\"2024-01-01 00:05:00\",\"multi\nline\",2.5\n2024-01-01 00:10:00,ml2,\n";
    fs::write(&path, format!("Time,Host\n{data}")).unwrap();
    let columns = ["Timestamp", "Hostname", "Value"];
    ensure_schema(&path, &columns).unwrap();
    let contents = fs::read_to_string(&path).unwrap();
    assert_eq!(contents, format!("Timestamp,Hostname,Value\n{data}"));

    // Now it's correct and is left alone.
    ensure_schema(&path, &columns).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), contents);
}

#[test]
fn test_ensure_schema_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    fs::write(&path, "").unwrap();
    ensure_schema(&path, &["A", "B"]).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "A,B\n");
}

#[test]
fn test_append_after_missing_newline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    fs::write(&path, "A,B\n1,2").unwrap();
    append(&path, &["A", "B"], &UsageRecord::new().field(3).field(4)).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "A,B\n1,2\n3,4\n");
}

#[test]
fn test_append_wrong_length() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    let r = append(&path, &["A", "B", "C"], &UsageRecord::new().field(1).field(2));
    assert!(matches!(
        r,
        Err(UsageError::RecordLength {
            expected: 3,
            found: 2
        })
    ));
    // Nothing was created.
    assert!(!path.exists());
}

#[test]
fn test_append_all_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.csv");
    fs::write(&path, "A,B\n").unwrap();
    let good = UsageRecord::new().field(1).field(2);
    let bad = UsageRecord::new().field(1);
    assert!(append_all(&path, &["A", "B"], &[good.clone(), bad]).is_err());
    assert_eq!(fs::read_to_string(&path).unwrap(), "A,B\n");
    append_all(&path, &["A", "B"], &[good.clone(), good]).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "A,B\n1,2\n1,2\n");
}

#[test]
fn test_unwritable_location() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no_such_dir").join("usage.csv");
    assert!(matches!(
        ensure_schema(&path, &["A"]),
        Err(UsageError::Io { .. })
    ));
}
