// Timestamp parsing and localization.
//
// The monitors write local wall-clock time without a zone, but logs that have been edited or
// produced elsewhere may carry an offset.  Parsing and localization are kept apart so that the
// (DST-sensitive) localization step can be tested on its own.

use chrono::{DateTime, FixedOffset, Months, NaiveDate, NaiveDateTime, TimeZone};

/// The format the monitors write.

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedTimestamp {
    /// No zone information; to be interpreted in the configured local zone.
    Naive(NaiveDateTime),

    /// Carries its own UTC offset.
    Zoned(DateTime<FixedOffset>),
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

const ZONED_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Parse a log timestamp.  Returns None if the string is not a recognized timestamp.

pub fn parse_timestamp(s: &str) -> Option<ParsedTimestamp> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(ParsedTimestamp::Zoned(t));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(s, fmt) {
            return Some(ParsedTimestamp::Zoned(t));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ParsedTimestamp::Naive(t));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(ParsedTimestamp::Naive);
    }
    None
}

/// Place a parsed timestamp in `tz`.  Zoned timestamps are converted.  Naive timestamps are taken
/// as wall-clock time in `tz`; a time repeated by a DST fall-back resolves to the earlier instant,
/// and a time skipped by a DST spring-forward cannot have been written by a local clock, so it
/// yields None.

pub fn localize<Tz: TimeZone>(t: &ParsedTimestamp, tz: &Tz) -> Option<DateTime<Tz>> {
    match t {
        ParsedTimestamp::Zoned(z) => Some(z.with_timezone(tz)),
        ParsedTimestamp::Naive(n) => tz.from_local_datetime(n).earliest(),
    }
}

/// Parse and localize in one step.

pub fn parse_local<Tz: TimeZone>(s: &str, tz: &Tz) -> Option<DateTime<Tz>> {
    parse_timestamp(s).and_then(|t| localize(&t, tz))
}

/// The oldest instant a retention window of `months` calendar months keeps, counting back from
/// `now`.  At month ends the day is clamped (May 31 minus 3 months is Feb 28 or 29).

pub fn retention_cutoff<Tz: TimeZone>(now: &DateTime<Tz>, months: u32) -> Option<DateTime<Tz>> {
    now.clone().checked_sub_months(Months::new(months))
}

#[cfg(test)]
use chrono::{Timelike, Utc};

#[test]
fn test_parse_naive() {
    let t = parse_timestamp("2024-01-15 10:20:30").unwrap();
    assert!(
        t == ParsedTimestamp::Naive(
            NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(10, 20, 30)
                .unwrap()
        )
    );
    assert!(matches!(
        parse_timestamp("2024-01-15T10:20:30.250"),
        Some(ParsedTimestamp::Naive(_))
    ));
    assert!(matches!(
        parse_timestamp("2024-01-15"),
        Some(ParsedTimestamp::Naive(_))
    ));
}

#[test]
fn test_parse_zoned() {
    assert!(matches!(
        parse_timestamp("2024-01-15T10:20:30+09:00"),
        Some(ParsedTimestamp::Zoned(_))
    ));
    assert!(matches!(
        parse_timestamp("2024-01-15 10:20:30+0100"),
        Some(ParsedTimestamp::Zoned(_))
    ));
}

#[test]
fn test_parse_garbage() {
    assert!(parse_timestamp("").is_none());
    assert!(parse_timestamp("   ").is_none());
    assert!(parse_timestamp("yesterday").is_none());
    assert!(parse_timestamp("2024-13-01 00:00:00").is_none());
}

#[test]
fn test_localize() {
    let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();

    // Naive time is wall-clock time in the zone.
    let t = parse_local("2024-01-15 10:00:00", &tokyo).unwrap();
    assert!(t.hour() == 10);
    assert!(t.with_timezone(&Utc).hour() == 1);

    // Zoned time is converted.
    let t = parse_local("2024-01-15T10:00:00+00:00", &tokyo).unwrap();
    assert!(t.hour() == 19);
}

#[test]
fn test_retention_cutoff() {
    let tz = FixedOffset::east_opt(0).unwrap();
    let now = tz.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    let cutoff = retention_cutoff(&now, 3).unwrap();
    assert!(cutoff == tz.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

    let now = tz.with_ymd_and_hms(2024, 5, 31, 12, 0, 0).unwrap();
    let cutoff = retention_cutoff(&now, 3).unwrap();
    assert!(cutoff == tz.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
}

#[test]
fn test_localize_across_dst() {
    use chrono_tz::Europe::Oslo;

    // 02:30 happens twice on 2024-10-27; the first one, still at +02:00, wins.
    let t = parse_local("2024-10-27 02:30:00", &Oslo).unwrap();
    assert!(t.with_timezone(&Utc) == Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap());

    // 02:30 never happens on 2024-03-31.
    assert!(parse_local("2024-03-31 02:30:00", &Oslo).is_none());
    assert!(parse_local("2024-03-31 03:30:00", &Oslo).is_some());

    // A zoned time in the gap is still a real instant.
    let t = parse_local("2024-03-31T00:30:00+00:00", &Oslo).unwrap();
    assert!(t.hour() == 1);
}

#[test]
fn test_retention_cutoff_in_dst_gap() {
    use chrono_tz::Europe::Oslo;
    let now = Oslo.with_ymd_and_hms(2024, 7, 31, 2, 30, 0).unwrap();
    assert!(retention_cutoff(&now, 4).is_none());
    let cutoff = retention_cutoff(&now, 3).unwrap();
    assert!(cutoff == Oslo.with_ymd_and_hms(2024, 4, 30, 2, 30, 0).unwrap());
}
