// The CPU monitor: one record per invocation with host-wide utilization, load averages, memory, and
// the three users with the highest summed %CPU.
//
// Utilization is measured over a short window, so `sample` blocks for the window's length.  The
// per-user figures come from a process query, normally `ps -eo user,%cpu`, and are summed per user
// in the order ps lists them; ties keep that order.  If the query fails, the user slots are all null
// and the record is still written.

use crate::sampler::ResourceSampler;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use sysinfo::System;
use usagelog::{CpuUsageRecord, Schema, UsageError, UsageRecord, UserCpu, CPU_SCHEMA};

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

// Below this the OS counters are too coarse to give a meaningful figure.
const MIN_WINDOW: Duration = Duration::from_millis(200);

const TOP_USERS: usize = 3;

/// Source of the per-process table: a header line, then one `user %cpu` line per process.

pub trait ProcessQuery {
    fn query(&self) -> Result<String>;
}

pub struct Ps;

impl ProcessQuery for Ps {
    fn query(&self) -> Result<String> {
        let output = Command::new("ps")
            .args(["-eo", "user,%cpu"])
            .output()
            .map_err(|e| UsageError::external_tool("ps", e.to_string()))?;
        if !output.status.success() {
            return Err(UsageError::external_tool("ps", output.status.to_string()).into());
        }
        Ok(String::from_utf8(output.stdout)
            .map_err(|e| UsageError::external_tool("ps", e.to_string()))?)
    }
}

pub struct CpuSampler<Q: ProcessQuery = Ps> {
    csv_path: PathBuf,
    window: Duration,
    system: System,
    processes: Q,
}

impl CpuSampler<Ps> {
    pub fn new(csv_path: PathBuf) -> CpuSampler<Ps> {
        CpuSampler::with_query(csv_path, Ps)
    }
}

impl<Q: ProcessQuery> CpuSampler<Q> {
    pub fn with_query(csv_path: PathBuf, processes: Q) -> CpuSampler<Q> {
        CpuSampler {
            csv_path,
            window: DEFAULT_WINDOW,
            system: System::new(),
            processes,
        }
    }

    pub fn with_window(mut self, window: Duration) -> CpuSampler<Q> {
        self.window = window.max(MIN_WINDOW);
        self
    }

    fn cpu_percent(&mut self) -> f64 {
        self.system.refresh_cpu();
        thread::sleep(self.window);
        self.system.refresh_cpu();
        self.system.global_cpu_info().cpu_usage() as f64
    }

    // Total, used, free, in MB.
    fn memory_mb(&mut self) -> (u64, u64, u64) {
        const MB: u64 = 1024 * 1024;
        self.system.refresh_memory();
        (
            self.system.total_memory() / MB,
            self.system.used_memory() / MB,
            self.system.free_memory() / MB,
        )
    }
}

impl<Q: ProcessQuery> ResourceSampler for CpuSampler<Q> {
    fn schema(&self) -> &'static Schema {
        &CPU_SCHEMA
    }

    fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    fn sample(&mut self) -> Result<Vec<UsageRecord>> {
        let timestamp = self.current_timestamp();
        let hostname = self.hostname();
        let cpu_pct = self.cpu_percent();
        let load = System::load_average();
        let (total_memory_mb, used_memory_mb, free_memory_mb) = self.memory_mb();
        let top_users = top_cpu_users(&self.processes);

        let record = CpuUsageRecord {
            timestamp,
            hostname,
            cpu_pct,
            load_avg: [load.one, load.five, load.fifteen],
            total_memory_mb,
            used_memory_mb,
            free_memory_mb,
            top_users,
        };
        tracing::debug!("{:?}", record);
        Ok(vec![UsageRecord::from(&record)])
    }
}

/// The up-to-three users with the highest summed %CPU, or nothing if the query fails.

pub fn top_cpu_users(processes: &impl ProcessQuery) -> Vec<UserCpu> {
    match processes.query() {
        Ok(text) => rank_users(parse_ps_output(&text)),
        Err(e) => {
            tracing::warn!("No per-user CPU figures: {}", e);
            vec![]
        }
    }
}

/// Sum %CPU per user over the lines of `ps -eo user,%cpu` output.  The first line is the header.
/// Users appear in the order of their first process; lines that don't parse are skipped.

pub fn parse_ps_output(text: &str) -> Vec<(String, f64)> {
    let mut totals: Vec<(String, f64)> = vec![];
    for line in text.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(user), Some(pct)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(pct) = pct.parse::<f64>() else {
            tracing::debug!("Skipping ps line {:?}", line);
            continue;
        };
        match totals.iter_mut().find(|(u, _)| u == user) {
            Some((_, total)) => *total += pct,
            None => totals.push((user.to_string(), pct)),
        }
    }
    totals
}

/// The top three of `totals` by %CPU, highest first.  The sort is stable, so ties keep their
/// order in `totals`.

pub fn rank_users(mut totals: Vec<(String, f64)>) -> Vec<UserCpu> {
    totals.sort_by(|a, b| b.1.total_cmp(&a.1));
    totals
        .into_iter()
        .take(TOP_USERS)
        .map(|(user, cpu_pct)| UserCpu { user, cpu_pct })
        .collect()
}

#[cfg(test)]
fn names(users: &[UserCpu]) -> Vec<&str> {
    users.iter().map(|u| u.user.as_str()).collect()
}

#[test]
fn test_rank_users() {
    let users = rank_users(vec![
        ("alice".to_string(), 30.0),
        ("bob".to_string(), 45.0),
        ("carol".to_string(), 10.0),
    ]);
    assert!(names(&users) == vec!["bob", "alice", "carol"]);
    assert!(users[0].cpu_pct == 45.0);
    assert!(users[1].cpu_pct == 30.0);
    assert!(users[2].cpu_pct == 10.0);
}

#[test]
fn test_rank_users_ties_and_truncation() {
    let users = rank_users(vec![
        ("x".to_string(), 5.0),
        ("y".to_string(), 7.0),
        ("z".to_string(), 5.0),
        ("w".to_string(), 1.0),
    ]);
    assert!(names(&users) == vec!["y", "x", "z"]);
    assert!(rank_users(vec![]).is_empty());
}

#[test]
fn test_parse_ps_output() {
    let text = "USER      %CPU\n\
                root       0.5\n\
                alice     20.0\n\
                bob       45.0\n\
                alice     10.0\n\
                carol     10.0\n\
                root       bad\n\
                \n";
    let totals = parse_ps_output(text);
    assert!(
        totals
            == vec![
                ("root".to_string(), 0.5),
                ("alice".to_string(), 30.0),
                ("bob".to_string(), 45.0),
                ("carol".to_string(), 10.0),
            ]
    );
    assert!(names(&rank_users(totals)) == vec!["bob", "alice", "carol"]);
}

#[test]
fn test_cpu_record_with_fewer_users() {
    use chrono::NaiveDate;
    let record = CpuUsageRecord {
        timestamp: NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap(),
        hostname: "ml1".to_string(),
        cpu_pct: 12.25,
        load_avg: [1.0, 0.5, 0.25],
        total_memory_mb: 2048,
        used_memory_mb: 1024,
        free_memory_mb: 512,
        top_users: rank_users(vec![("alice".to_string(), 3.0)]),
    };
    let r = UsageRecord::from(&record);
    assert!(r.len() == CPU_SCHEMA.columns.len());
    assert!(r.get(9) == Some("alice"));
    assert!(r.get(11).is_none() && r.get(14).is_none());
}

#[cfg(test)]
struct FakePs(&'static str);

#[cfg(test)]
impl ProcessQuery for FakePs {
    fn query(&self) -> Result<String> {
        Ok(self.0.to_string())
    }
}

#[cfg(test)]
struct BrokenPs;

#[cfg(test)]
impl ProcessQuery for BrokenPs {
    fn query(&self) -> Result<String> {
        Err(UsageError::external_tool("ps", "exit status: 1").into())
    }
}

#[test]
fn test_sample_ranks_users() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_usage.csv");
    let mut sampler = CpuSampler::with_query(
        path.clone(),
        FakePs("USER %CPU\nalice 30.0\nbob 45.0\ncarol 10.0\ndave 1.0\n"),
    )
    .with_window(Duration::ZERO);
    sampler.monitor().unwrap();

    let log = usagelog::read_log(&path).unwrap();
    assert!(log.columns == CPU_SCHEMA.columns);
    assert!(log.rows.len() == 1);
    let row = &log.rows[0];
    assert!(row.get(9) == Some("bob") && row.get(11) == Some("alice") && row.get(13) == Some("carol"));
}

#[test]
fn test_sample_without_process_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu_usage.csv");
    let mut sampler = CpuSampler::with_query(path.clone(), BrokenPs).with_window(Duration::ZERO);
    assert!(sampler.monitor().unwrap().len() == 1);
    sampler.monitor().unwrap();

    let log = usagelog::read_log(&path).unwrap();
    assert!(log.rows.len() == 2);
    for row in &log.rows {
        assert!(row.get(0).is_some() && row.get(1).is_some() && row.get(2).is_some());
        assert!((9..=14).all(|i| row.get(i).is_none()));
    }
}
