// The capability shared by the CPU and GPU monitors.
//
// A sampler is stateless between invocations: it reads the OS, builds records, and appends them.
// Nothing is retried, and all fallible reads happen before the first byte is written, so a failed
// sample never leaves a partial row behind.

use anyhow::Result;
use chrono::{Local, NaiveDateTime, Timelike};
use std::path::Path;
use sysinfo::System;
use usagelog::{Schema, UsageRecord};

pub trait ResourceSampler {
    /// The layout of the records this sampler produces.
    fn schema(&self) -> &'static Schema;

    /// The log the records are appended to.
    fn csv_path(&self) -> &Path;

    /// Read the OS and return the records for one invocation: one for the CPU, one per device for
    /// the GPU, possibly none.
    fn sample(&mut self) -> Result<Vec<UsageRecord>>;

    /// Local wall-clock time, whole seconds.
    fn current_timestamp(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }

    fn hostname(&self) -> String {
        host_name()
    }

    /// Append the records to the log.  With no records the log is not touched, not even created.
    fn persist(&self, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        usagelog::append_all(self.csv_path(), self.schema().columns, records)?;
        Ok(())
    }

    /// Sample, then persist, and return what was written.
    fn monitor(&mut self) -> Result<Vec<UsageRecord>> {
        let records = self.sample()?;
        self.persist(&records)?;
        tracing::debug!(
            "Appended {} {} record(s) to {:?}",
            records.len(),
            self.schema().name,
            self.csv_path()
        );
        Ok(records)
    }
}

/// The node name, as uname reports it.

pub fn host_name() -> String {
    match System::host_name() {
        Some(name) if !name.is_empty() => name,
        _ => {
            tracing::warn!("Could not determine the host name");
            "unknown".to_string()
        }
    }
}
