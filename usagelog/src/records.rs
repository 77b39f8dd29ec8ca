// Record layouts for the CPU and GPU usage logs.
//
// A log is a CSV file with a header row naming the columns of its schema, followed by one row per
// sample.  Fields are positional: the header is the contract, and records are built and read in
// exactly the column order given here.
//
// CPU log, one row per monitor invocation:
//
//  Column               Gloss                                     Format
//  -------------------  ----------------------------------------  -----------------------------
//  Timestamp            Local wall-clock time of the sample       YYYY-MM-DD HH:MM:SS
//  Hostname             Host name                                 Text
//  CPU Usage(%)         Utilization over the sampling window      Float, one decimal
//  Load Average(1m)     OS load averages                          Float, two decimals
//  Load Average(5m)
//  Load Average(15m)
//  Total Memory(MB)     Physical memory                           Integer MB
//  Used Memory(MB)
//  Free Memory(MB)
//  Top User             User with the highest summed process CPU  Text, or empty
//  Top CPU Usage(%)     That user's summed CPU percentage         Float, one decimal, or empty
//  Second User, Second CPU Usage(%), Third User, Third CPU Usage(%)
//
// GPU log, one row per device per monitor invocation, all rows of an invocation sharing the
// timestamp and host name:
//
//  Timestamp, Hostname, GPU Index, Name, Temp(C), Power Usage(W), Power Cap(W), Mem Usage(MB),
//  Mem Total(MB), GPU Util(%)
//
// Empty fields are nulls.

use crate::dates::TIMESTAMP_FORMAT;
use chrono::NaiveDateTime;

/// How a mandatory field is validated by the retention pass.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Timestamp,
    Text,
    Number,
}

/// A named column layout, the columns that must be present and valid for a row to be kept, and
/// the column that reports chart.

#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub mandatory: &'static [(&'static str, FieldKind)],
    pub value_column: &'static str,
    pub default_path: &'static str,
}

pub const CPU_COLUMNS: [&str; 15] = [
    "Timestamp",
    "Hostname",
    "CPU Usage(%)",
    "Load Average(1m)",
    "Load Average(5m)",
    "Load Average(15m)",
    "Total Memory(MB)",
    "Used Memory(MB)",
    "Free Memory(MB)",
    "Top User",
    "Top CPU Usage(%)",
    "Second User",
    "Second CPU Usage(%)",
    "Third User",
    "Third CPU Usage(%)",
];

pub const GPU_COLUMNS: [&str; 10] = [
    "Timestamp",
    "Hostname",
    "GPU Index",
    "Name",
    "Temp(C)",
    "Power Usage(W)",
    "Power Cap(W)",
    "Mem Usage(MB)",
    "Mem Total(MB)",
    "GPU Util(%)",
];

pub static CPU_SCHEMA: Schema = Schema {
    name: "cpu",
    columns: &CPU_COLUMNS,
    mandatory: &[
        ("Timestamp", FieldKind::Timestamp),
        ("Hostname", FieldKind::Text),
        ("CPU Usage(%)", FieldKind::Number),
    ],
    value_column: "CPU Usage(%)",
    default_path: "cpu_usage.csv",
};

pub static GPU_SCHEMA: Schema = Schema {
    name: "gpu",
    columns: &GPU_COLUMNS,
    mandatory: &[
        ("Timestamp", FieldKind::Timestamp),
        ("Hostname", FieldKind::Text),
        ("GPU Util(%)", FieldKind::Number),
    ],
    value_column: "GPU Util(%)",
    default_path: "gpu_usage.csv",
};

/// One row of a log: an ordered sequence of possibly-null fields.  Nulls are written as empty
/// fields and empty fields read back as nulls.

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageRecord {
    values: Vec<Option<String>>,
}

impl UsageRecord {
    pub fn new() -> UsageRecord {
        UsageRecord { values: vec![] }
    }

    /// Build a record from CSV fields, mapping empty fields to null.

    pub fn from_fields<'a, I>(fields: I) -> UsageRecord
    where
        I: IntoIterator<Item = &'a str>,
    {
        UsageRecord {
            values: fields
                .into_iter()
                .map(|f| if f.is_empty() { None } else { Some(f.to_string()) })
                .collect(),
        }
    }

    pub fn field(mut self, value: impl ToString) -> UsageRecord {
        self.values.push(Some(value.to_string()));
        self
    }

    pub fn maybe<T: ToString>(mut self, value: Option<T>) -> UsageRecord {
        self.values.push(value.map(|v| v.to_string()));
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The value at `i`, or None if the field is null or out of range.

    pub fn get(&self, i: usize) -> Option<&str> {
        self.values.get(i).and_then(|v| v.as_deref())
    }

    /// The fields as they are written to CSV.

    pub fn csv_fields(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|v| v.as_deref().unwrap_or(""))
    }
}

/// A user and the sum of the CPU percentages of that user's processes.

#[derive(Debug, Clone, PartialEq)]
pub struct UserCpu {
    pub user: String,
    pub cpu_pct: f64,
}

#[derive(Debug, Clone)]
pub struct CpuUsageRecord {
    pub timestamp: NaiveDateTime,
    pub hostname: String,
    pub cpu_pct: f64,
    pub load_avg: [f64; 3],
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,

    /// At most three users, highest first.  Missing slots are written as nulls.
    pub top_users: Vec<UserCpu>,
}

impl From<&CpuUsageRecord> for UsageRecord {
    fn from(r: &CpuUsageRecord) -> UsageRecord {
        let mut record = UsageRecord::new()
            .field(r.timestamp.format(TIMESTAMP_FORMAT))
            .field(hostname_field(&r.hostname))
            .field(format!("{:.1}", r.cpu_pct))
            .field(format!("{:.2}", r.load_avg[0]))
            .field(format!("{:.2}", r.load_avg[1]))
            .field(format!("{:.2}", r.load_avg[2]))
            .field(r.total_memory_mb)
            .field(r.used_memory_mb)
            .field(r.free_memory_mb);
        for slot in 0..3 {
            match r.top_users.get(slot) {
                Some(u) => {
                    record = record.field(&u.user).field(format!("{:.1}", u.cpu_pct));
                }
                None => {
                    record = record.maybe::<String>(None).maybe::<String>(None);
                }
            }
        }
        record
    }
}

#[derive(Debug, Clone)]
pub struct GpuUsageRecord {
    pub timestamp: NaiveDateTime,
    pub hostname: String,
    pub index: u32,
    pub name: String,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub power_limit_w: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub utilization_pct: Option<f64>,
}

impl From<&GpuUsageRecord> for UsageRecord {
    fn from(r: &GpuUsageRecord) -> UsageRecord {
        UsageRecord::new()
            .field(r.timestamp.format(TIMESTAMP_FORMAT))
            .field(hostname_field(&r.hostname))
            .field(r.index)
            .field(&r.name)
            .maybe(r.temperature_c)
            .maybe(r.power_draw_w)
            .maybe(r.power_limit_w)
            .maybe(r.memory_used_mb)
            .maybe(r.memory_total_mb)
            .maybe(r.utilization_pct)
    }
}

// A host name is mandatory, so an empty one must not turn into a null that the retention pass
// would later drop.
fn hostname_field(hostname: &str) -> &str {
    if hostname.is_empty() {
        "unknown"
    } else {
        hostname
    }
}

#[cfg(test)]
use chrono::NaiveDate;

#[cfg(test)]
fn test_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 5)
        .unwrap()
        .and_hms_opt(14, 7, 9)
        .unwrap()
}

#[test]
fn test_cpu_record_layout() {
    let r = CpuUsageRecord {
        timestamp: test_time(),
        hostname: "ml3".to_string(),
        cpu_pct: 12.345,
        load_avg: [1.0, 0.5, 0.25],
        total_memory_mb: 2048,
        used_memory_mb: 1024,
        free_memory_mb: 512,
        top_users: vec![UserCpu {
            user: "bob".to_string(),
            cpu_pct: 45.0,
        }],
    };
    let rec = UsageRecord::from(&r);
    assert!(rec.len() == CPU_COLUMNS.len());
    let fields = rec.csv_fields().collect::<Vec<&str>>();
    assert_eq!(
        fields,
        vec![
            "2024-03-05 14:07:09",
            "ml3",
            "12.3",
            "1.00",
            "0.50",
            "0.25",
            "2048",
            "1024",
            "512",
            "bob",
            "45.0",
            "",
            "",
            "",
            ""
        ]
    );
    assert!(rec.get(11).is_none());
}

#[test]
fn test_gpu_record_layout() {
    let r = GpuUsageRecord {
        timestamp: test_time(),
        hostname: "ml6".to_string(),
        index: 1,
        name: "NVIDIA A100".to_string(),
        temperature_c: Some(50.0),
        power_draw_w: None,
        power_limit_w: Some(250.0),
        memory_used_mb: Some(2000.0),
        memory_total_mb: Some(8192.0),
        utilization_pct: Some(80.5),
    };
    let rec = UsageRecord::from(&r);
    assert!(rec.len() == GPU_COLUMNS.len());
    let fields = rec.csv_fields().collect::<Vec<&str>>();
    assert_eq!(
        fields,
        vec![
            "2024-03-05 14:07:09",
            "ml6",
            "1",
            "NVIDIA A100",
            "50",
            "",
            "250",
            "2000",
            "8192",
            "80.5"
        ]
    );
}

#[test]
fn test_from_fields_nulls() {
    let rec = UsageRecord::from_fields(vec!["a", "", "c"]);
    assert!(rec.len() == 3);
    assert!(rec.get(0) == Some("a"));
    assert!(rec.get(1).is_none());
    assert!(rec.get(7).is_none());
}

#[test]
fn test_schemas_name_their_value_column() {
    for schema in [&CPU_SCHEMA, &GPU_SCHEMA] {
        assert!(schema.columns.contains(&schema.value_column));
        for (col, _) in schema.mandatory {
            assert!(schema.columns.contains(col));
        }
    }
}
