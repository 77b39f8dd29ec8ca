// Report configuration: an optional JSON file, plus the Slack credentials from the environment.
//
// The file holds a single object; every field is optional:
//
//   cpu_log - string, path of the CPU usage log
//   gpu_log - string, path of the GPU usage log
//   img_dir - string, directory for the chart images
//   retention_months - integer, age in months beyond which log rows are dropped
//   utc_offset - string, "+hh:mm" or "-hh:mm", the zone for naive timestamps and for "now"
//   trend_days - integer, lookback of the trend chart
//   baseline_days - integer, lookback of the strip charts
//   highlight_days - integer, the recent part of the strip charts drawn in orange
//   font - string, path of a TrueType font for chart text
//
// Command line flags override the file.

use anyhow::{bail, Result};
use chrono::FixedOffset;
use serde_json::Value;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use usagelog::UsageError;

pub const SLACK_TOKEN_VAR: &str = "SLACK_BOT_TOKEN";
pub const SLACK_CHANNEL_VAR: &str = "SLACK_CHANNEL_ID";

// See above comment block for field documentation.

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReportConfig {
    pub cpu_log: Option<String>,
    pub gpu_log: Option<String>,
    pub img_dir: Option<String>,
    pub retention_months: Option<u32>,
    pub utc_offset: Option<String>,
    pub trend_days: Option<u64>,
    pub baseline_days: Option<u64>,
    pub highlight_days: Option<u64>,
    pub font: Option<String>,
}

// The file is hand-written and its fields come and go, so decode a generic JSON value field by field
// rather than derive a strict parser, and name the offending field on error.

pub fn read_from_json(filename: &Path) -> Result<ReportConfig> {
    let file = File::open(filename)?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)?;
    decode_config(v)
}

fn decode_config(v: Value) -> Result<ReportConfig> {
    let Value::Object(fields) = v else {
        bail!("Expected an object value")
    };
    let mut config: ReportConfig = Default::default();
    config.cpu_log = grab_string(&fields, "cpu_log")?;
    config.gpu_log = grab_string(&fields, "gpu_log")?;
    config.img_dir = grab_string(&fields, "img_dir")?;
    config.utc_offset = grab_string(&fields, "utc_offset")?;
    config.font = grab_string(&fields, "font")?;
    config.trend_days = grab_u64(&fields, "trend_days")?;
    config.baseline_days = grab_u64(&fields, "baseline_days")?;
    config.highlight_days = grab_u64(&fields, "highlight_days")?;
    config.retention_months = match grab_u64(&fields, "retention_months")? {
        Some(n) => match u32::try_from(n) {
            Ok(n) => Some(n),
            Err(_) => bail!("Field 'retention_months' is out of range"),
        },
        None => None,
    };
    Ok(config)
}

fn grab_string(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<String>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => bail!("Field '{name}' must have a string value"),
    }
}

fn grab_u64(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(n) = n.as_u64() {
                Ok(Some(n))
            } else {
                bail!("Field '{name}' must have unsigned integer value")
            }
        }
        Some(_) => bail!("Field '{name}' must have an integer value"),
    }
}

/// Parse "+hh:mm", "-hh:mm", "+hhmm" or "+hh".  "Z" is UTC.

pub fn parse_utc_offset(s: &str) -> usagelog::Result<FixedOffset> {
    let bad = || UsageError::Validation(format!("Bad UTC offset '{s}', expected e.g. +09:00"));
    let s = s.trim();
    if s == "Z" || s == "z" {
        return FixedOffset::east_opt(0).ok_or_else(bad);
    }
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(bad()),
    };
    let digits = rest.replace(':', "");
    if !(digits.len() == 2 || digits.len() == 4) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let hours = digits[..2].parse::<i32>().map_err(|_| bad())?;
    let minutes = if digits.len() == 4 {
        digits[2..].parse::<i32>().map_err(|_| bad())?
    } else {
        0
    };
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// Credentials for posting to a Slack channel.

#[derive(Clone, PartialEq)]
pub struct SlackConfig {
    pub token: String,
    pub channel: String,
}

// Keep the token out of logs.
impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("token", &"<redacted>")
            .field("channel", &self.channel)
            .finish()
    }
}

impl SlackConfig {
    /// Read SLACK_BOT_TOKEN and SLACK_CHANNEL_ID.  Both must be set and nonempty.

    pub fn from_env() -> usagelog::Result<SlackConfig> {
        SlackConfig::from_values(env::var(SLACK_TOKEN_VAR).ok(), env::var(SLACK_CHANNEL_VAR).ok())
    }

    pub fn from_values(
        token: Option<String>,
        channel: Option<String>,
    ) -> usagelog::Result<SlackConfig> {
        let token = nonempty(token, SLACK_TOKEN_VAR)?;
        let channel = nonempty(channel, SLACK_CHANNEL_VAR)?;
        Ok(SlackConfig { token, channel })
    }
}

fn nonempty(value: Option<String>, var: &str) -> usagelog::Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(UsageError::Auth(format!("{var} is not set"))),
    }
}

#[test]
fn test_decode_config() {
    let v = serde_json::json!({
        "cpu_log": "/var/log/usage/cpu_usage.csv",
        "retention_months": 6,
        "utc_offset": "+09:00",
        "trend_days": 14,
        "font": null
    });
    let config = decode_config(v).unwrap();
    assert!(config.cpu_log.as_deref() == Some("/var/log/usage/cpu_usage.csv"));
    assert!(config.gpu_log.is_none());
    assert!(config.retention_months == Some(6));
    assert!(config.utc_offset.as_deref() == Some("+09:00"));
    assert!(config.trend_days == Some(14));
    assert!(config.font.is_none());
}

#[test]
fn test_decode_config_errors() {
    assert!(decode_config(serde_json::json!([])).is_err());
    assert!(decode_config(serde_json::json!({"cpu_log": 3})).is_err());
    assert!(decode_config(serde_json::json!({"trend_days": -1})).is_err());
    assert!(decode_config(serde_json::json!({"trend_days": "8"})).is_err());
    assert!(decode_config(serde_json::json!({"retention_months": 5000000000u64})).is_err());
}

#[test]
fn test_read_from_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    std::fs::write(&path, r#"{ "img_dir": "charts", "highlight_days": 3 }"#).unwrap();
    let config = read_from_json(&path).unwrap();
    assert!(config.img_dir.as_deref() == Some("charts"));
    assert!(config.highlight_days == Some(3));
    assert!(read_from_json(&dir.path().join("nope.json")).is_err());
}

#[test]
fn test_parse_utc_offset() {
    assert!(parse_utc_offset("+09:00").unwrap().local_minus_utc() == 9 * 3600);
    assert!(parse_utc_offset("-0530").unwrap().local_minus_utc() == -(5 * 3600 + 30 * 60));
    assert!(parse_utc_offset("+02").unwrap().local_minus_utc() == 7200);
    assert!(parse_utc_offset("Z").unwrap().local_minus_utc() == 0);
    for bad in ["09:00", "+9", "+25:00", "+09:60", "+09:0a", ""] {
        assert!(matches!(parse_utc_offset(bad), Err(UsageError::Validation(_))));
    }
}

#[test]
fn test_slack_config() {
    let c = SlackConfig::from_values(Some("xoxb-1".to_string()), Some("C123".to_string())).unwrap();
    assert!(c.token == "xoxb-1" && c.channel == "C123");
    assert!(!format!("{:?}", c).contains("xoxb"));
    assert!(matches!(
        SlackConfig::from_values(None, Some("C123".to_string())),
        Err(UsageError::Auth(_))
    ));
    assert!(matches!(
        SlackConfig::from_values(Some("xoxb-1".to_string()), Some(" ".to_string())),
        Err(UsageError::Auth(_))
    ));
}
