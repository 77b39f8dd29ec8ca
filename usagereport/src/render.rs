// Chart rendering for one usage table (CPU or GPU).
//
// Each table yields three JPEG artifacts, each a grid of per-host subplots:
//
//   timeseries_trend_<name>.jpg   - the value over the last `trend_days` days, as a line
//   dayofweek_boxplot_<name>.jpg  - strip plot by weekday over `baseline_days`, with the last
//                                   `highlight_days` overlaid in orange
//   hour_boxplot_<name>.jpg       - the same by hour of day
//
// Lookback windows are relative to the latest day in the table, not to the current time, so a
// report over a stale log still shows the data it has.  The grid has two columns and as many rows
// as needed, at least one; cells without a host are drawn as empty plots.  The y axis is always
// 0..100.
//
// Text needs a TrueType font.  If none can be loaded the charts are drawn without captions or axis
// labels.

use anyhow::{anyhow, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Timelike};
use itertools::Itertools;
use plotters::coord::Shift;
use plotters::prelude::*;
use std::cmp::max;
use std::fs;
use std::path::{Path, PathBuf};
use usagelog::{Sample, Schema};

pub const FACET_COLUMNS: usize = 2;

const CELL_WIDTH: u32 = 700;
const CELL_HEIGHT: u32 = 300;

const HIGHLIGHT_COLOR: RGBColor = RGBColor(255, 165, 0);

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

// Searched in order when no font is configured.
const FONT_CANDIDATES: [&str; 5] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
];

/// One log's samples, ready for charting.

pub struct UsageTable {
    pub schema: &'static Schema,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookback {
    pub trend_days: u64,
    pub baseline_days: u64,
    pub highlight_days: u64,
}

impl Default for Lookback {
    fn default() -> Lookback {
        Lookback {
            trend_days: 8,
            baseline_days: 28,
            highlight_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifacts {
    pub trend: PathBuf,
    pub dayofweek: PathBuf,
    pub hour: PathBuf,
}

impl ReportArtifacts {
    pub fn in_dir(dir: &Path, name: &str) -> ReportArtifacts {
        ReportArtifacts {
            trend: dir.join(format!("timeseries_trend_{name}.jpg")),
            dayofweek: dir.join(format!("dayofweek_boxplot_{name}.jpg")),
            hour: dir.join(format!("hour_boxplot_{name}.jpg")),
        }
    }

    /// Top to bottom, the order they are composited in.
    pub fn paths(&self) -> [&Path; 3] {
        [&self.trend, &self.dayofweek, &self.hour]
    }
}

pub trait ReportRenderer {
    /// Render the table's three charts into `dir`, overwriting earlier ones.
    fn render(&self, table: &UsageTable, lookback: &Lookback, dir: &Path)
        -> Result<ReportArtifacts>;
}

/// The samples whose day is on or after the latest day in `samples` minus `days` days.

pub fn past_days(samples: &[Sample], days: u64) -> Vec<&Sample> {
    let Some(last) = samples.iter().map(|s| s.time.date()).max() else {
        return vec![];
    };
    let start = last.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN);
    samples.iter().filter(|s| s.time.date() >= start).collect()
}

/// Sorted, without duplicates.

pub fn host_names(samples: &[&Sample]) -> Vec<String> {
    samples
        .iter()
        .map(|s| s.hostname.clone())
        .sorted()
        .dedup()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetGrid {
    pub hosts: Vec<String>,
    pub rows: usize,
}

impl FacetGrid {
    pub fn new(hosts: Vec<String>) -> FacetGrid {
        let rows = max(1, (hosts.len() + FACET_COLUMNS - 1) / FACET_COLUMNS);
        FacetGrid { hosts, rows }
    }

    /// Row-major, None for a placeholder cell.
    pub fn cells(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        (0..self.rows * FACET_COLUMNS).map(|i| self.hosts.get(i).map(|h| h.as_str()))
    }

    pub fn placeholders(&self) -> usize {
        self.rows * FACET_COLUMNS - self.hosts.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binning {
    DayOfWeek,
    Hour,
}

impl Binning {
    pub fn categories(self) -> usize {
        match self {
            Binning::DayOfWeek => 7,
            Binning::Hour => 24,
        }
    }

    /// Monday is 0.
    pub fn bin(self, t: &NaiveDateTime) -> usize {
        match self {
            Binning::DayOfWeek => t.weekday().num_days_from_monday() as usize,
            Binning::Hour => t.hour() as usize,
        }
    }

    pub fn label(self, category: usize) -> String {
        match self {
            Binning::DayOfWeek => WEEKDAYS[category % 7].to_string(),
            Binning::Hour => category.to_string(),
        }
    }

    fn title(self) -> &'static str {
        match self {
            Binning::DayOfWeek => "Trend",
            Binning::Hour => "Stripplot",
        }
    }
}

/// Horizontal offset for the `i`th point of a strip, in [-0.2, 0.2).  Deterministic, so the same
/// data always gives the same picture.

pub fn jitter(i: usize) -> f64 {
    let h = (i as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40;
    (h as f64 / (1u64 << 24) as f64 - 0.5) * 0.4
}

/// Trend axis labels: date and weekday at midnight, otherwise the hour.

// Only midnights are labelled; the noon ticks get a grid line but no text.
pub fn trend_label(t: &NaiveDateTime) -> String {
    if t.hour() == 0 && t.minute() == 0 {
        t.format("%m-%d (%a)").to_string()
    } else {
        String::new()
    }
}

pub struct PlottersRenderer {
    text: bool,
}

impl PlottersRenderer {
    /// Load `font`, or the first usable system font if None.

    pub fn new(font: Option<&Path>) -> PlottersRenderer {
        let text = match font {
            Some(path) => register_font_file(path),
            None => FONT_CANDIDATES
                .iter()
                .any(|p| Path::new(p).exists() && register_font_file(Path::new(p))),
        };
        if !text {
            tracing::warn!("No usable font, charts will have no labels");
        }
        PlottersRenderer { text }
    }

    fn label_area(&self, size: u32) -> u32 {
        if self.text {
            size
        } else {
            0
        }
    }

    // Draw the grid into a white RGB image of the right size and save it.  The image format
    // follows the extension of `path`.
    fn draw_grid(
        &self,
        path: &Path,
        grid: &FacetGrid,
        mut draw_cell: impl FnMut(&DrawingArea<BitMapBackend<'_>, Shift>, &str) -> Result<()>,
    ) -> Result<()> {
        let width = CELL_WIDTH * FACET_COLUMNS as u32;
        let height = CELL_HEIGHT * grid.rows as u32;
        tracing::debug!(
            "{:?}: {} hosts, {} empty cells",
            path,
            grid.hosts.len(),
            grid.placeholders()
        );
        let mut buffer = vec![255u8; (width * height * 3) as usize];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
            root.fill(&WHITE)?;
            let areas = root.split_evenly((grid.rows, FACET_COLUMNS));
            for (area, cell) in areas.iter().zip(grid.cells()) {
                match cell {
                    Some(host) => draw_cell(area, host)?,
                    None => self.draw_placeholder(area)?,
                }
            }
            root.present()?;
        }
        let img = image::RgbImage::from_raw(width, height, buffer)
            .ok_or_else(|| anyhow!("Chart buffer does not match {width}x{height}"))?;
        img.save(path)?;
        tracing::debug!("Wrote {:?}", path);
        Ok(())
    }

    fn draw_placeholder(&self, area: &DrawingArea<BitMapBackend<'_>, Shift>) -> Result<()> {
        let mut chart = ChartBuilder::on(area)
            .margin(10)
            .x_label_area_size(self.label_area(30))
            .y_label_area_size(self.label_area(40))
            .build_cartesian_2d(0.0..1.0, 0.0..100.0)?;
        chart.configure_mesh().disable_x_mesh().draw()?;
        Ok(())
    }

    fn render_trend(&self, table: &UsageTable, days: u64, path: &Path) -> Result<()> {
        let samples = past_days(&table.samples, days);
        let grid = FacetGrid::new(host_names(&samples));
        let color = table_color(table.schema);

        // The x axis is hours since midnight at the start of the window.
        let (start, span) = match samples.iter().map(|s| s.time.date()).minmax().into_option() {
            Some((first, last)) => {
                let start = first.and_hms_opt(0, 0, 0).unwrap_or_default();
                let days = (last - first).num_days() + 1;
                (start, (days * 24) as f64)
            }
            None => (NaiveDateTime::default(), 24.0),
        };
        let label_at = |x: &f64| trend_label(&(start + chrono::Duration::seconds((x * 3600.0) as i64)));

        self.draw_grid(path, &grid, |area, host| {
            let mut builder = ChartBuilder::on(area);
            builder
                .margin(10)
                .x_label_area_size(self.label_area(50))
                .y_label_area_size(self.label_area(40));
            if self.text {
                builder.caption(
                    format!("{} Trend for {}", table.schema.value_column, host),
                    ("sans-serif", 16),
                );
            }
            let mut chart = builder.build_cartesian_2d((0.0..span).step(12.0), 0.0..100.0)?;
            chart
                .configure_mesh()
                .x_labels((span / 12.0) as usize + 1)
                .x_label_formatter(&label_at)
                .x_desc("Time")
                .y_desc(table.schema.value_column)
                .draw()?;
            let points = samples
                .iter()
                .filter(|s| s.hostname == host)
                .map(|s| ((s.time - start).num_seconds() as f64 / 3600.0, s.value))
                .collect::<Vec<(f64, f64)>>();
            chart.draw_series(LineSeries::new(points.iter().copied(), &color))?;
            // A line needs two points, so mark every sample too.
            chart.draw_series(
                points
                    .iter()
                    .map(|&p| Circle::new(p, 2, color.filled())),
            )?;
            Ok(())
        })
    }

    fn render_strips(
        &self,
        table: &UsageTable,
        lookback: &Lookback,
        binning: Binning,
        path: &Path,
    ) -> Result<()> {
        let baseline = past_days(&table.samples, lookback.baseline_days);
        let highlight = past_days(&table.samples, lookback.highlight_days);
        let grid = FacetGrid::new(host_names(&baseline));
        let color = table_color(table.schema);
        let n = binning.categories();
        let label_at = |x: &f64| {
            let c = x.round();
            if (x - c).abs() < 0.01 && c >= 0.0 && (c as usize) < n {
                binning.label(c as usize)
            } else {
                String::new()
            }
        };

        self.draw_grid(path, &grid, |area, host| {
            let mut builder = ChartBuilder::on(area);
            builder
                .margin(10)
                .x_label_area_size(self.label_area(40))
                .y_label_area_size(self.label_area(40));
            if self.text {
                builder.caption(
                    format!(
                        "{} {} for {}",
                        table.schema.value_column,
                        binning.title(),
                        host
                    ),
                    ("sans-serif", 16),
                );
            }
            let mut chart = builder.build_cartesian_2d(-0.5..(n as f64 - 0.5), 0.0..100.0)?;
            chart
                .configure_mesh()
                .x_labels(2 * n + 1)
                .x_label_formatter(&label_at)
                .x_desc("Time")
                .y_desc(table.schema.value_column)
                .draw()?;
            for (points, color) in [(&baseline, color), (&highlight, HIGHLIGHT_COLOR)] {
                chart.draw_series(
                    points
                        .iter()
                        .filter(|s| s.hostname == host)
                        .enumerate()
                        .map(|(i, s)| {
                            let x = binning.bin(&s.time) as f64 + jitter(i);
                            Circle::new((x, s.value), 2, color.filled())
                        }),
                )?;
            }
            Ok(())
        })
    }
}

impl ReportRenderer for PlottersRenderer {
    fn render(
        &self,
        table: &UsageTable,
        lookback: &Lookback,
        dir: &Path,
    ) -> Result<ReportArtifacts> {
        let artifacts = ReportArtifacts::in_dir(dir, table.schema.name);
        self.render_trend(table, lookback.trend_days, &artifacts.trend)?;
        self.render_strips(table, lookback, Binning::DayOfWeek, &artifacts.dayofweek)?;
        self.render_strips(table, lookback, Binning::Hour, &artifacts.hour)?;
        tracing::info!(
            "Rendered {} charts for {} samples",
            table.schema.name,
            table.samples.len()
        );
        Ok(artifacts)
    }
}

fn table_color(schema: &Schema) -> RGBColor {
    match schema.name {
        "gpu" => RGBColor(44, 160, 44),
        _ => RGBColor(31, 119, 180),
    }
}

// The font stays registered for the life of the process.
fn register_font_file(path: &Path) -> bool {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Could not read font {:?}: {}", path, e);
            return false;
        }
    };
    let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
    match plotters::style::register_font("sans-serif", FontStyle::Normal, bytes) {
        Ok(()) => {
            tracing::debug!("Using font {:?}", path);
            true
        }
        Err(_) => {
            tracing::warn!("Unusable font {:?}", path);
            false
        }
    }
}

#[cfg(test)]
fn sample(host: &str, time: &str, value: f64) -> Sample {
    Sample {
        hostname: host.to_string(),
        time: NaiveDateTime::parse_from_str(time, "%Y-%m-%d %H:%M:%S").unwrap(),
        value,
    }
}

#[test]
fn test_past_days() {
    let samples = vec![
        sample("ml1", "2024-03-01 23:59:59", 1.0),
        sample("ml1", "2024-03-02 00:00:00", 2.0),
        sample("ml2", "2024-03-09 12:00:00", 3.0),
        sample("ml2", "2024-03-10 08:00:00", 4.0),
    ];
    // The window is relative to the newest day, 2024-03-10, and includes its start day.
    let kept = past_days(&samples, 8);
    assert!(kept.iter().map(|s| s.value).collect::<Vec<f64>>() == vec![2.0, 3.0, 4.0]);
    assert!(past_days(&samples, 0).len() == 1);
    assert!(past_days(&[], 8).is_empty());
}

#[test]
fn test_host_names() {
    let samples = vec![
        sample("ml3", "2024-03-01 00:00:00", 1.0),
        sample("ml1", "2024-03-01 00:00:00", 1.0),
        sample("ml3", "2024-03-01 00:05:00", 1.0),
    ];
    let refs = samples.iter().collect::<Vec<&Sample>>();
    assert!(host_names(&refs) == vec!["ml1", "ml3"]);
}

#[test]
fn test_facet_grid() {
    let grid = FacetGrid::new(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert!(grid.rows == 2);
    assert!(grid.placeholders() == 1);
    assert!(grid.cells().collect::<Vec<Option<&str>>>() == vec![Some("a"), Some("b"), Some("c"), None]);

    let grid = FacetGrid::new(vec!["a".to_string(), "b".to_string()]);
    assert!(grid.rows == 1 && grid.placeholders() == 0);

    let grid = FacetGrid::new(vec![]);
    assert!(grid.rows == 1 && grid.placeholders() == 2);
}

#[test]
fn test_binning() {
    // 2024-03-04 is a Monday.
    let t = sample("ml1", "2024-03-04 13:30:00", 0.0).time;
    assert!(Binning::DayOfWeek.bin(&t) == 0);
    assert!(Binning::Hour.bin(&t) == 13);
    let t = sample("ml1", "2024-03-10 00:00:00", 0.0).time;
    assert!(Binning::DayOfWeek.bin(&t) == 6);
    assert!(Binning::DayOfWeek.label(6) == "Sunday");
    assert!(Binning::Hour.label(7) == "7");
}

#[test]
fn test_jitter_is_small_and_stable() {
    for i in 0..1000 {
        let j = jitter(i);
        assert!(j >= -0.2 && j < 0.2);
        assert!(j == jitter(i));
    }
}

#[test]
fn test_trend_label() {
    assert!(trend_label(&sample("x", "2024-03-04 00:00:00", 0.0).time) == "03-04 (Mon)");
    assert!(trend_label(&sample("x", "2024-03-04 12:00:00", 0.0).time).is_empty());
    assert!(trend_label(&sample("x", "2024-03-04 00:30:00", 0.0).time).is_empty());
}

#[test]
fn test_artifact_names() {
    let a = ReportArtifacts::in_dir(Path::new("img"), "gpu");
    assert!(a.trend == Path::new("img/timeseries_trend_gpu.jpg"));
    assert!(a.dayofweek == Path::new("img/dayofweek_boxplot_gpu.jpg"));
    assert!(a.hour == Path::new("img/hour_boxplot_gpu.jpg"));
}

#[test]
fn test_plotters_renderer_image_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let table = UsageTable {
        schema: &usagelog::CPU_SCHEMA,
        samples: vec![
            sample("ml1", "2024-03-01 10:00:00", 10.0),
            sample("ml2", "2024-03-02 11:00:00", 20.0),
            sample("ml3", "2024-03-03 12:00:00", 30.0),
        ],
    };
    // No font: this exercises the label-free drawing path regardless of the host's fonts.
    let renderer = PlottersRenderer { text: false };
    let artifacts = renderer.render(&table, &Lookback::default(), dir.path()).unwrap();
    for path in artifacts.paths() {
        let img = image::open(path).unwrap();
        assert!(img.width() == CELL_WIDTH * 2);
        assert!(img.height() == CELL_HEIGHT * 2);
    }
}

#[test]
fn test_trend_marks_single_sample_host() {
    let dir = tempfile::tempdir().unwrap();
    let table = UsageTable {
        schema: &usagelog::GPU_SCHEMA,
        samples: vec![sample("ml1", "2024-03-01 10:00:00", 50.0)],
    };
    // PNG keeps colors exact, so the series color can be found pixel by pixel.
    let path = dir.path().join("trend.png");
    PlottersRenderer { text: false }
        .render_trend(&table, 8, &path)
        .unwrap();
    let img = image::open(&path).unwrap().to_rgb8();
    let RGBColor(r, g, b) = table_color(table.schema);
    assert!(img.pixels().any(|p| p.0 == [r, g, b]));
}
