// `usagemon` -- Sample CPU or GPU usage once and append it to a CSV log.
//
// usagemon cpu|gpu [--csv_path path.csv] [--interval-ms n] [-v]
//
// Run it from cron (or any scheduler) at whatever cadence the reports should have.  Each run appends
// one CPU record, or one GPU record per device, creating the log with a header if necessary and
// rewriting the header if the log was written with an older column layout.
//
// Diagnostics go to stderr; RUST_LOG overrides the default level.

mod cpu;
mod gpu;
mod sampler;

use crate::cpu::CpuSampler;
use crate::gpu::GpuSampler;
use crate::sampler::ResourceSampler;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use usagelog::{UsageError, CPU_SCHEMA, GPU_SCHEMA};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The resource to sample
    #[arg(value_enum)]
    monitor_type: MonitorType,

    /// Append to this log, which must have a .csv name [default: cpu_usage.csv or gpu_usage.csv]
    #[arg(long = "csv_path", visible_alias = "csv-path")]
    csv_path: Option<String>,

    /// Measure CPU utilization over this many milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Print debug information to stderr
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum MonitorType {
    Cpu,
    Gpu,
}

fn main() {
    match usagemon() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn usagemon() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let csv_path = resolve_csv_path(cli.monitor_type, cli.csv_path.as_deref())?;
    let mut sampler: Box<dyn ResourceSampler> = match cli.monitor_type {
        MonitorType::Cpu => Box::new(
            CpuSampler::new(csv_path).with_window(Duration::from_millis(cli.interval_ms)),
        ),
        MonitorType::Gpu => Box::new(GpuSampler::new(csv_path)),
    };

    let records = sampler.monitor()?;
    tracing::info!(
        "Wrote {} {} record(s) to {:?}",
        records.len(),
        sampler.schema().name,
        sampler.csv_path()
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// The path is checked before anything is sampled or touched on disk.
fn resolve_csv_path(
    monitor_type: MonitorType,
    csv_path: Option<&str>,
) -> usagelog::Result<PathBuf> {
    match csv_path {
        Some(p) if !p.ends_with(".csv") => Err(UsageError::Validation(format!(
            "The log path must end with '.csv': {p}"
        ))),
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(PathBuf::from(match monitor_type {
            MonitorType::Cpu => CPU_SCHEMA.default_path,
            MonitorType::Gpu => GPU_SCHEMA.default_path,
        })),
    }
}

#[test]
fn test_resolve_csv_path() {
    assert!(resolve_csv_path(MonitorType::Cpu, None).unwrap() == PathBuf::from("cpu_usage.csv"));
    assert!(resolve_csv_path(MonitorType::Gpu, None).unwrap() == PathBuf::from("gpu_usage.csv"));
    assert!(
        resolve_csv_path(MonitorType::Gpu, Some("logs/g.csv")).unwrap()
            == PathBuf::from("logs/g.csv")
    );
    assert!(matches!(
        resolve_csv_path(MonitorType::Cpu, Some("usage.txt")),
        Err(UsageError::Validation(_))
    ));
    assert!(matches!(
        resolve_csv_path(MonitorType::Cpu, Some("usage.csv.bak")),
        Err(UsageError::Validation(_))
    ));
}

#[test]
fn test_cli() {
    let cli = Cli::try_parse_from(["usagemon", "gpu", "--csv_path", "x.csv"]).unwrap();
    assert!(cli.monitor_type == MonitorType::Gpu);
    assert!(cli.csv_path.as_deref() == Some("x.csv"));
    assert!(cli.interval_ms == 1000);

    let cli = Cli::try_parse_from(["usagemon", "cpu", "--csv-path", "y.csv", "-v"]).unwrap();
    assert!(cli.monitor_type == MonitorType::Cpu && cli.verbose);

    assert!(Cli::try_parse_from(["usagemon", "disk"]).is_err());
    assert!(Cli::try_parse_from(["usagemon"]).is_err());
}
