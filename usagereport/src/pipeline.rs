// The report run: clean both logs, load them, render CPU then GPU charts, composite, deliver.
//
// Any failure before delivery aborts the run and nothing is posted.  Images already written stay on
// disk and are overwritten by the next run.

use crate::composite::{combine_files, Direction};
use crate::notify::Notifier;
use crate::render::{Lookback, ReportArtifacts, ReportRenderer, UsageTable};

use anyhow::Result;
use chrono::{DateTime, TimeZone};
use std::fs;
use std::path::{Path, PathBuf};
use usagelog::{clean_logfile, load_samples, UsageError, CPU_SCHEMA, GPU_SCHEMA};

pub const CAPTION: &str = "Resource Report";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cpu_log: PathBuf,
    pub gpu_log: PathBuf,
    pub img_dir: PathBuf,
    pub retention_months: u32,
    pub lookback: Lookback,
}

/// Run the retention pass over both logs.  A missing log is skipped.

pub fn clean_logs<Tz: TimeZone>(settings: &PipelineSettings, now: &DateTime<Tz>) -> Result<()> {
    for (path, schema) in [(&settings.cpu_log, &CPU_SCHEMA), (&settings.gpu_log, &GPU_SCHEMA)] {
        clean_logfile(path, schema, now, settings.retention_months)?;
    }
    Ok(())
}

pub struct ReportPipeline<'a, R: ReportRenderer> {
    settings: PipelineSettings,
    renderer: R,
    notifier: Option<&'a dyn Notifier>,
}

impl<'a, R: ReportRenderer> ReportPipeline<'a, R> {
    /// With no notifier the report is only written to disk.

    pub fn new(
        settings: PipelineSettings,
        renderer: R,
        notifier: Option<&'a dyn Notifier>,
    ) -> ReportPipeline<'a, R> {
        ReportPipeline {
            settings,
            renderer,
            notifier,
        }
    }

    /// Returns the path of the final image.

    pub fn run<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<PathBuf> {
        let settings = &self.settings;
        clean_logs(settings, now)?;

        let tz = now.timezone();
        let cpu = UsageTable {
            schema: &CPU_SCHEMA,
            samples: load_samples(&settings.cpu_log, &CPU_SCHEMA, &tz)?,
        };
        let gpu = UsageTable {
            schema: &GPU_SCHEMA,
            samples: load_samples(&settings.gpu_log, &GPU_SCHEMA, &tz)?,
        };

        let dir = &settings.img_dir;
        fs::create_dir_all(dir).map_err(|e| UsageError::io(dir, e))?;
        let cpu_artifacts = self.renderer.render(&cpu, &settings.lookback, dir)?;
        let gpu_artifacts = self.renderer.render(&gpu, &settings.lookback, dir)?;

        let cpu_combined = combine_table(&cpu_artifacts, dir, "cpu")?;
        let gpu_combined = combine_table(&gpu_artifacts, dir, "gpu")?;
        let combined = dir.join("combined_image.jpg");
        combine_files(
            &[cpu_combined.as_path(), gpu_combined.as_path()],
            &combined,
            Direction::Horizontal,
        )?;
        tracing::info!("Report image is {:?}", combined);

        if let Some(notifier) = self.notifier {
            notifier.post_file(CAPTION, &combined)?;
        }
        Ok(combined)
    }
}

fn combine_table(artifacts: &ReportArtifacts, dir: &Path, name: &str) -> Result<PathBuf> {
    let output = dir.join(format!("combined_image_{name}.jpg"));
    combine_files(&artifacts.paths(), &output, Direction::Vertical)?;
    Ok(output)
}

#[cfg(test)]
use chrono::FixedOffset;
#[cfg(test)]
use std::cell::RefCell;

// Writes solid images of a fixed size, or fails.
#[cfg(test)]
struct FakeRenderer {
    fail: bool,
    rendered: RefCell<Vec<(String, usize)>>,
}

#[cfg(test)]
impl ReportRenderer for FakeRenderer {
    fn render(&self, table: &UsageTable, _: &Lookback, dir: &Path) -> Result<ReportArtifacts> {
        if self.fail {
            anyhow::bail!("renderer broke");
        }
        self.rendered
            .borrow_mut()
            .push((table.schema.name.to_string(), table.samples.len()));
        let artifacts = ReportArtifacts::in_dir(dir, table.schema.name);
        for path in artifacts.paths() {
            image::RgbImage::from_pixel(40, 10, image::Rgb([0, 0, 255])).save(path)?;
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
#[derive(Default)]
struct FakeNotifier {
    posts: RefCell<Vec<(String, PathBuf)>>,
}

#[cfg(test)]
impl Notifier for FakeNotifier {
    fn post_file(&self, caption: &str, path: &Path) -> Result<()> {
        self.posts
            .borrow_mut()
            .push((caption.to_string(), path.to_path_buf()));
        Ok(())
    }
}

#[cfg(test)]
fn test_settings(dir: &Path) -> PipelineSettings {
    let cpu_log = dir.join("cpu_usage.csv");
    fs::write(
        &cpu_log,
        usagelog::CPU_COLUMNS.join(",")
            + "\n"
            + "2024-03-30 10:00:00,ml1,12.5,1.00,0.50,0.25,2048,1024,512,bob,45.0,,,,\n"
            + "2024-03-31 10:00:00,ml2,22.5,1.00,0.50,0.25,2048,1024,512,,,,,,\n"
            + "2023-11-30 10:00:00,ml2,22.5,1.00,0.50,0.25,2048,1024,512,,,,,,\n"
            + "2024-03-31 11:00:00,ml2,,1.00,0.50,0.25,2048,1024,512,,,,,,\n",
    )
    .unwrap();
    PipelineSettings {
        cpu_log,
        gpu_log: dir.join("gpu_usage.csv"),
        img_dir: dir.join("img"),
        retention_months: 3,
        lookback: Lookback::default(),
    }
}

#[cfg(test)]
fn test_now() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(9 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 4, 1, 0, 0, 0)
        .unwrap()
}

#[test]
fn test_pipeline_runs_and_delivers() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let renderer = FakeRenderer {
        fail: false,
        rendered: RefCell::new(vec![]),
    };
    let notifier = FakeNotifier::default();
    let pipeline = ReportPipeline::new(settings.clone(), renderer, Some(&notifier));
    let combined = pipeline.run(&test_now()).unwrap();

    // CPU first, with the expired and invalid rows cleaned out; the missing GPU log is empty.
    assert!(
        *pipeline.renderer.rendered.borrow()
            == vec![("cpu".to_string(), 2), ("gpu".to_string(), 0)]
    );
    assert!(usagelog::read_log(&settings.cpu_log).unwrap().rows.len() == 2);

    let img = image::open(settings.img_dir.join("combined_image_cpu.jpg")).unwrap();
    assert!(img.width() == 40 && img.height() == 30);
    let img = image::open(&combined).unwrap();
    assert!(img.width() == 80 && img.height() == 30);

    let posts = notifier.posts.borrow();
    assert!(posts.len() == 1);
    assert!(posts[0].0 == "Resource Report");
    assert!(posts[0].1 == settings.img_dir.join("combined_image.jpg"));
}

#[test]
fn test_pipeline_render_failure_is_not_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let renderer = FakeRenderer {
        fail: true,
        rendered: RefCell::new(vec![]),
    };
    let notifier = FakeNotifier::default();
    let pipeline = ReportPipeline::new(settings, renderer, Some(&notifier));
    assert!(pipeline.run(&test_now()).is_err());
    assert!(notifier.posts.borrow().is_empty());
}

#[test]
fn test_pipeline_without_notifier() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let renderer = FakeRenderer {
        fail: false,
        rendered: RefCell::new(vec![]),
    };
    let pipeline = ReportPipeline::new(settings, renderer, None);
    assert!(pipeline.run(&test_now()).unwrap().exists());
}

#[test]
fn test_clean_logs_only() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    clean_logs(&settings, &test_now()).unwrap();
    assert!(usagelog::read_log(&settings.cpu_log).unwrap().rows.len() == 2);
    assert!(!settings.gpu_log.exists());
    assert!(!settings.img_dir.exists());
}
