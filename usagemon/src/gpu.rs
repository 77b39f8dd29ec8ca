// The GPU monitor: one record per device reported by nvidia-smi, all with the same timestamp and
// host name.
//
// A host without nvidia-smi has no GPUs to report and yields no records, and the log is not
// created.  The same holds when nvidia-smi is installed but finds no devices (exit 6) or no loaded
// driver (exit 9).  If nvidia-smi fails in any other way, or prints something we can't read, the
// whole sample is an error and nothing is written, so a log never holds a partial set of devices
// for one time.  Fields nvidia-smi can't supply ("[N/A]") are written as nulls.

use crate::sampler::ResourceSampler;

use anyhow::Result;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use usagelog::{GpuUsageRecord, Schema, UsageError, UsageRecord, GPU_SCHEMA};

pub const NVIDIA_SMI: &str = "nvidia-smi";

const QUERY_FIELDS: &str =
    "index,name,temperature.gpu,power.draw,power.limit,memory.used,memory.total,utilization.gpu";

/// Source of the device table, one CSV line per device in QUERY_FIELDS order without header or
/// units.  Returns None if there is no GPU driver on the host.

pub trait GpuQuery {
    fn query(&self) -> Result<Option<String>>;
}

// nvidia-smi exit codes that mean there is nothing to sample.
const NO_DEVICES_FOUND: i32 = 6;
const DRIVER_NOT_LOADED: i32 = 9;

pub struct NvidiaSmi {
    program: PathBuf,
}

impl Default for NvidiaSmi {
    fn default() -> NvidiaSmi {
        NvidiaSmi::at(PathBuf::from(NVIDIA_SMI))
    }
}

impl NvidiaSmi {
    pub fn at(program: PathBuf) -> NvidiaSmi {
        NvidiaSmi { program }
    }
}

impl GpuQuery for NvidiaSmi {
    fn query(&self) -> Result<Option<String>> {
        let output = match Command::new(&self.program)
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("{} not found, no GPUs to sample", NVIDIA_SMI);
                return Ok(None);
            }
            Err(e) => return Err(UsageError::external_tool(NVIDIA_SMI, e.to_string()).into()),
        };
        interpret_output(output.status.code(), output.stdout, &output.stderr)
    }
}

// Classify a finished nvidia-smi run by its exit code and output.
fn interpret_output(code: Option<i32>, stdout: Vec<u8>, stderr: &[u8]) -> Result<Option<String>> {
    match code {
        Some(0) => {
            let stdout = String::from_utf8(stdout)
                .map_err(|e| UsageError::external_tool(NVIDIA_SMI, e.to_string()))?;
            Ok(Some(stdout))
        }
        Some(code @ (NO_DEVICES_FOUND | DRIVER_NOT_LOADED)) => {
            let message = String::from_utf8_lossy(if stdout.is_empty() { stderr } else { &stdout[..] })
                .trim()
                .to_string();
            tracing::info!("{} exited with {}, no GPUs to sample: {}", NVIDIA_SMI, code, message);
            Ok(None)
        }
        _ => {
            let status = match code {
                Some(code) => format!("exit status: {code}"),
                None => "killed by signal".to_string(),
            };
            let stderr = String::from_utf8_lossy(stderr);
            Err(UsageError::external_tool(NVIDIA_SMI, format!("{}: {}", status, stderr.trim())).into())
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
struct DeviceRow {
    index: u32,
    name: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    temperature: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    power_draw: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    power_limit: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    memory_used: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    memory_total: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    utilization: Option<f64>,
}

// All rows or an error.
fn parse_devices(output: &str) -> Result<Vec<DeviceRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(output.as_bytes());
    let mut rows = vec![];
    for row in reader.deserialize::<DeviceRow>() {
        let row = row.map_err(|e| {
            UsageError::external_tool(NVIDIA_SMI, format!("Unreadable output: {e}"))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

pub struct GpuSampler<Q: GpuQuery = NvidiaSmi> {
    csv_path: PathBuf,
    query: Q,
}

impl GpuSampler<NvidiaSmi> {
    pub fn new(csv_path: PathBuf) -> GpuSampler<NvidiaSmi> {
        GpuSampler::with_query(csv_path, NvidiaSmi::default())
    }
}

impl<Q: GpuQuery> GpuSampler<Q> {
    pub fn with_query(csv_path: PathBuf, query: Q) -> GpuSampler<Q> {
        GpuSampler { csv_path, query }
    }
}

impl<Q: GpuQuery> ResourceSampler for GpuSampler<Q> {
    fn schema(&self) -> &'static Schema {
        &GPU_SCHEMA
    }

    fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    fn sample(&mut self) -> Result<Vec<UsageRecord>> {
        let Some(output) = self.query.query()? else {
            return Ok(vec![]);
        };
        let devices = parse_devices(&output)?;
        let timestamp = self.current_timestamp();
        let hostname = self.hostname();
        Ok(devices
            .into_iter()
            .map(|d| {
                UsageRecord::from(&GpuUsageRecord {
                    timestamp,
                    hostname: hostname.clone(),
                    index: d.index,
                    name: d.name,
                    temperature_c: d.temperature,
                    power_draw_w: d.power_draw,
                    power_limit_w: d.power_limit,
                    memory_used_mb: d.memory_used,
                    memory_total_mb: d.memory_total,
                    utilization_pct: d.utilization,
                })
            })
            .collect())
    }
}

#[cfg(test)]
struct FakeSmi(Option<&'static str>);

#[cfg(test)]
impl GpuQuery for FakeSmi {
    fn query(&self) -> Result<Option<String>> {
        Ok(self.0.map(|s| s.to_string()))
    }
}

#[cfg(test)]
struct BrokenSmi;

#[cfg(test)]
impl GpuQuery for BrokenSmi {
    fn query(&self) -> Result<Option<String>> {
        Err(UsageError::external_tool(NVIDIA_SMI, "exit status: 9").into())
    }
}

#[test]
fn test_parse_devices() {
    let rows = parse_devices(
        "0, NVIDIA GeForce RTX 2080 Ti, 41, 21.30, 250.00, 2, 11264, 0\n\
         1, NVIDIA GeForce RTX 2080 Ti, [N/A], [N/A], 250.00, 2, 11264, 97\n",
    )
    .unwrap();
    assert!(rows.len() == 2);
    assert!(rows[0].name == "NVIDIA GeForce RTX 2080 Ti");
    assert!(rows[0].temperature == Some(41.0));
    assert!(rows[1].index == 1);
    assert!(rows[1].temperature.is_none() && rows[1].power_draw.is_none());
    assert!(rows[1].utilization == Some(97.0));
}

#[test]
fn test_sample_one_row_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    let mut sampler = GpuSampler::with_query(
        path.clone(),
        FakeSmi(Some(
            "0, Tesla V100, 40, 50.5, 300, 100, 16384, 12\n\
             1, Tesla V100, 41, 51.5, 300, 200, 16384, 34\n\
             2, Tesla V100, 42, 52.5, 300, 300, 16384, [N/A]\n",
        )),
    );
    let records = sampler.monitor().unwrap();
    assert!(records.len() == 3);

    let log = usagelog::read_log(&path).unwrap();
    assert!(log.columns == GPU_SCHEMA.columns);
    assert!(log.rows.len() == 3);
    for row in &log.rows {
        assert!(row.get(0) == log.rows[0].get(0));
        assert!(row.get(1) == log.rows[0].get(1));
        assert!(row.get(1).is_some());
    }
    assert!(log.rows[1].get(2) == Some("1"));
    assert!(log.rows[1].get(9) == Some("34"));
    assert!(log.rows[2].get(9).is_none());
}

#[test]
fn test_sample_no_gpus() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    let mut sampler = GpuSampler::with_query(path.clone(), FakeSmi(None));
    assert!(sampler.monitor().unwrap().is_empty());
    let mut sampler = GpuSampler::with_query(path.clone(), FakeSmi(Some("")));
    assert!(sampler.monitor().unwrap().is_empty());
    assert!(!path.exists());
}

#[test]
fn test_sample_failure_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");

    let mut sampler = GpuSampler::with_query(path.clone(), BrokenSmi);
    assert!(sampler.monitor().is_err());

    let mut sampler = GpuSampler::with_query(
        path.clone(),
        FakeSmi(Some("0, Tesla V100, 40, 50.5, 300, 100, 16384, 12\nNo devices were found\n")),
    );
    let err = sampler.monitor().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UsageError>(),
        Some(UsageError::ExternalTool { .. })
    ));
    assert!(!path.exists());
}

#[test]
fn test_interpret_output() {
    let out = interpret_output(Some(0), b"0, Tesla V100, 40, 50, 300, 1, 2, 3\n".to_vec(), b"");
    assert!(out.unwrap().unwrap().starts_with("0, Tesla V100"));

    let out = interpret_output(Some(6), b"No devices were found\n".to_vec(), b"");
    assert!(out.unwrap().is_none());
    let out = interpret_output(
        Some(9),
        vec![],
        b"NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver.\n",
    );
    assert!(out.unwrap().is_none());

    let err = interpret_output(Some(2), vec![], b"Invalid combination of input arguments.\n")
        .unwrap_err();
    match err.downcast_ref::<UsageError>() {
        Some(UsageError::ExternalTool { reason, .. }) => {
            assert!(reason == "exit status: 2: Invalid combination of input arguments.")
        }
        _ => panic!("expected an external tool error"),
    }
    assert!(interpret_output(None, vec![], b"").is_err());
    assert!(interpret_output(Some(0), vec![0xff, 0xfe], b"").is_err());
}

// A stand-in nvidia-smi that prints `stdout` and exits with `code`.
#[cfg(all(test, unix))]
fn scripted_smi(dir: &Path, stdout: &str, code: i32) -> NvidiaSmi {
    use std::os::unix::fs::PermissionsExt;
    let program = dir.join(format!("nvidia-smi-{code}"));
    std::fs::write(&program, format!("#!/bin/sh\necho '{stdout}'\nexit {code}\n")).unwrap();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
    NvidiaSmi::at(program)
}

#[cfg(unix)]
#[test]
fn test_sample_smi_without_devices() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu_usage.csv");
    for (stdout, code) in [
        ("No devices were found", 6),
        ("NVIDIA-SMI has failed because it could not communicate with the NVIDIA driver.", 9),
    ] {
        let mut sampler = GpuSampler::with_query(path.clone(), scripted_smi(dir.path(), stdout, code));
        assert!(sampler.monitor().unwrap().is_empty());
    }
    assert!(!path.exists());

    let mut sampler = GpuSampler::with_query(path.clone(), scripted_smi(dir.path(), "", 3));
    assert!(sampler.monitor().is_err());
    assert!(!path.exists());
}

#[test]
fn test_missing_smi_is_no_gpus() {
    let dir = tempfile::tempdir().unwrap();
    let smi = NvidiaSmi::at(dir.path().join("no-such-nvidia-smi"));
    assert!(smi.query().unwrap().is_none());
}
