// `usagereport` -- Clean the usage logs and post a chart report.
//
// usagereport clean  [options]   run the retention pass over both logs
// usagereport report [options]   clean, then chart both logs and post the result
//
// Settings come from the command line, then from the optional JSON file given by --config-file
// (see configs.rs), then from built-in defaults.  Posting to Slack needs SLACK_BOT_TOKEN and
// SLACK_CHANNEL_ID in the environment; they are checked before any work is done.
//
// Naive timestamps in the logs, and "now", are taken in the zone given by --utc-offset, or in the
// process's local zone (TZ) if there is none.

mod composite;
mod configs;
mod notify;
mod pipeline;
mod render;

use crate::configs::{parse_utc_offset, ReportConfig, SlackConfig};
use crate::notify::{Notifier, SlackSession};
use crate::pipeline::{clean_logs, PipelineSettings, ReportPipeline};
use crate::render::{Lookback, PlottersRenderer};

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use usagelog::{CPU_SCHEMA, DEFAULT_RETENTION_MONTHS, GPU_SCHEMA};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drop invalid and expired rows from the usage logs
    Clean(CleanArgs),

    /// Clean the logs, chart them, and post the charts
    Report(ReportArgs),
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Where to post the report
    #[arg(long, value_enum, default_value_t = ReportTo::Slack)]
    report_to: ReportTo,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Read settings from this JSON file [default: none]
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// The CPU usage log [default: cpu_usage.csv]
    #[arg(long)]
    cpu_log: Option<PathBuf>,

    /// The GPU usage log [default: gpu_usage.csv]
    #[arg(long)]
    gpu_log: Option<PathBuf>,

    /// Directory for the chart images [default: img]
    #[arg(long)]
    img_dir: Option<PathBuf>,

    /// Drop log rows older than this many months [default: 3]
    #[arg(long)]
    retention_months: Option<u32>,

    /// Zone of naive timestamps, e.g. +09:00 [default: the local zone]
    #[arg(long, allow_hyphen_values = true)]
    utc_offset: Option<String>,

    /// Print debug information to stderr
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ReportTo {
    Slack,
    None,
}

// Settings after merging the command line, the config file, and the defaults.
#[derive(Debug)]
struct Settings {
    pipeline: PipelineSettings,
    utc_offset: Option<String>,
    font: Option<PathBuf>,
}

fn main() {
    match usagereport() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn usagereport() -> Result<()> {
    let cli = Cli::parse();
    let (common, report_to) = match &cli.command {
        Commands::Clean(args) => (&args.common, None),
        Commands::Report(args) => (&args.common, Some(args.report_to)),
    };
    init_logging(common.verbose);

    let config = match &common.config_file {
        Some(path) => configs::read_from_json(path)?,
        None => ReportConfig::default(),
    };
    let settings = merge_settings(common, config);
    tracing::debug!("{:?}", settings);

    // Resolve the zone before touching anything.
    match &settings.utc_offset {
        Some(offset) => {
            let tz = parse_utc_offset(offset)?;
            run(&settings, report_to, &Utc::now().with_timezone(&tz))
        }
        None => run(&settings, report_to, &Local::now()),
    }
}

fn run<Tz: TimeZone>(
    settings: &Settings,
    report_to: Option<ReportTo>,
    now: &DateTime<Tz>,
) -> Result<()> {
    match report_to {
        None => clean_logs(&settings.pipeline, now),
        Some(report_to) => {
            // Credentials are checked before any rendering.
            let session = match report_to {
                ReportTo::Slack => Some(SlackSession::connect(SlackConfig::from_env()?)?),
                ReportTo::None => None,
            };
            let renderer = PlottersRenderer::new(settings.font.as_deref());
            let pipeline = ReportPipeline::new(
                settings.pipeline.clone(),
                renderer,
                session.as_ref().map(|s| s as &dyn Notifier),
            );
            pipeline.run(now)?;
            Ok(())
        }
    }
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

fn merge_settings(common: &CommonArgs, config: ReportConfig) -> Settings {
    let path_or = |flag: &Option<PathBuf>, file: Option<String>, default: &str| {
        flag.clone()
            .or(file.map(PathBuf::from))
            .unwrap_or_else(|| Path::new(default).to_path_buf())
    };
    let defaults = Lookback::default();
    Settings {
        pipeline: PipelineSettings {
            cpu_log: path_or(&common.cpu_log, config.cpu_log, CPU_SCHEMA.default_path),
            gpu_log: path_or(&common.gpu_log, config.gpu_log, GPU_SCHEMA.default_path),
            img_dir: path_or(&common.img_dir, config.img_dir, "img"),
            retention_months: common
                .retention_months
                .or(config.retention_months)
                .unwrap_or(DEFAULT_RETENTION_MONTHS),
            lookback: Lookback {
                trend_days: config.trend_days.unwrap_or(defaults.trend_days),
                baseline_days: config.baseline_days.unwrap_or(defaults.baseline_days),
                highlight_days: config.highlight_days.unwrap_or(defaults.highlight_days),
            },
        },
        utc_offset: common.utc_offset.clone().or(config.utc_offset),
        font: config.font.map(PathBuf::from),
    }
}

#[test]
fn test_cli() {
    let cli = Cli::try_parse_from(["usagereport", "report", "--report-to", "none", "-v"]).unwrap();
    match cli.command {
        Commands::Report(args) => {
            assert!(args.report_to == ReportTo::None);
            assert!(args.common.verbose);
        }
        _ => panic!("expected report"),
    }

    let cli = Cli::try_parse_from(["usagereport", "report"]).unwrap();
    assert!(matches!(cli.command, Commands::Report(ReportArgs { report_to: ReportTo::Slack, .. })));

    let cli =
        Cli::try_parse_from(["usagereport", "clean", "--utc-offset", "-05:00", "--cpu-log", "c.csv"])
            .unwrap();
    match cli.command {
        Commands::Clean(args) => {
            assert!(args.common.utc_offset.as_deref() == Some("-05:00"));
            assert!(args.common.cpu_log == Some(PathBuf::from("c.csv")));
        }
        _ => panic!("expected clean"),
    }

    assert!(Cli::try_parse_from(["usagereport", "report", "--report-to", "email"]).is_err());
}

#[test]
fn test_merge_settings() {
    let cli = Cli::try_parse_from(["usagereport", "clean", "--gpu-log", "flag_gpu.csv"]).unwrap();
    let Commands::Clean(args) = cli.command else {
        panic!("expected clean")
    };
    let config = ReportConfig {
        gpu_log: Some("file_gpu.csv".to_string()),
        img_dir: Some("charts".to_string()),
        retention_months: Some(6),
        trend_days: Some(14),
        ..Default::default()
    };
    let settings = merge_settings(&args.common, config);
    let p = &settings.pipeline;
    // Flag over file over default.
    assert!(p.gpu_log == PathBuf::from("flag_gpu.csv"));
    assert!(p.img_dir == PathBuf::from("charts"));
    assert!(p.cpu_log == PathBuf::from("cpu_usage.csv"));
    assert!(p.retention_months == 6);
    assert!(p.lookback.trend_days == 14 && p.lookback.baseline_days == 28);
    assert!(settings.utc_offset.is_none());
}
