// This library handles the CSV usage logs written by `usagemon` and read by `usagereport`.  It
// appends records to logs (repairing the header if the schema has drifted), reads logs back
// forgivingly, runs the retention pass, and extracts chartable samples.
//
// There is no locking anywhere.  Appends and rewrites of one log must be serialized by whoever
// schedules the tools.

mod dates;
mod error;
mod load;
mod logclean;
mod logfile;
mod logstore;
mod records;

// Timestamp format, parsing, and localization to a configured zone.

pub use dates::{localize, parse_local, parse_timestamp, retention_cutoff, ParsedTimestamp, TIMESTAMP_FORMAT};

pub use error::{Result, UsageError};

// Append to a log, creating it or repairing its header first.

pub use logstore::{append, append_all, ensure_schema};

// Read and rewrite whole logs.

pub use logfile::{read_log, read_log_if_exists, write_log, UsageLog};

// Drop invalid and expired rows from a log.

pub use logclean::{clean_log, clean_logfile, CleanStats, DEFAULT_RETENTION_MONTHS};

// Extract (host, time, value) samples from a log.

pub use load::{load_samples, Sample};

pub use records::{
    CpuUsageRecord, FieldKind, GpuUsageRecord, Schema, UsageRecord, UserCpu, CPU_COLUMNS,
    CPU_SCHEMA, GPU_COLUMNS, GPU_SCHEMA,
};
