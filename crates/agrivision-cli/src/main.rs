//! AgriVision - drone imagery to field health reports
//!
//! The `agrivision` command runs one project directory through the pipeline:
//!
//! - `resize`: bound raw image size
//! - `orthophoto`: stitch with OpenDroneMap
//! - `ndvi`: vegetation index raster and preview
//! - `grid_classify`: per-cell health classes
//! - `report`: HTML report, with weather when the service is available
//!
//! Exit code 0 means the run finished; each failure kind has its own code.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, Level};

use agrivision_core::{PipelineError, SkipFlags, StageStatus};
use agrivision_pipeline::{Pipeline, PipelineOutcome, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "agrivision")]
#[command(author = "AgriVision Developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drone imagery pipeline: orthophoto, NDVI, grid health and report", long_about = None)]
struct Cli {
    /// Project directory
    #[arg(long, default_value = ".", env = "AGRIVISION_PROJECT")]
    project: PathBuf,

    /// Configuration file (default: <project>/agrivision.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run id (default: current UTC time, e.g. 20240615_093012)
    #[arg(long)]
    run_id: Option<String>,

    /// Skip image resizing; the resized images must already exist
    #[arg(long)]
    skip_resize: bool,

    /// Skip the OpenDroneMap stage; the orthophoto must already exist
    #[arg(long)]
    skip_odm: bool,

    /// Skip NDVI, grid classification and the report
    #[arg(long)]
    skip_ndvi: bool,

    /// Skip grid classification and the report
    #[arg(long)]
    skip_grid: bool,

    /// Skip the report
    #[arg(long)]
    skip_report: bool,

    /// Do not contact the weather service
    #[arg(long)]
    no_weather: bool,

    /// Recompute every stage even when its inputs are unchanged
    #[arg(long)]
    force: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn skip_flags(&self) -> SkipFlags {
        SkipFlags {
            resize: self.skip_resize,
            odm: self.skip_odm,
            ndvi: self.skip_ndvi,
            grid: self.skip_grid,
            report: self.skip_report,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.project.join("agrivision.toml"))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    agrivision_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config_path = cli.config_path();
    debug!(config = %config_path.display(), "Loading configuration");
    let config = match agrivision_core::config::load(&config_path) {
        Ok(config) => config.with_skips(cli.skip_flags()),
        Err(e) => return Ok(report_error(&PipelineError::from(e))),
    };

    let pipeline = Pipeline::new(cli.project.clone(), config);
    let options = RunOptions {
        run_id: cli.run_id.clone(),
        force: cli.force,
        no_weather: cli.no_weather,
    };
    let outcome = match pipeline.run(options).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(report_error(&e)),
    };

    print_summary(&outcome, &pipeline);
    Ok(match &outcome.error {
        Some(e) => report_error(e),
        None => 0,
    })
}

fn print_summary(outcome: &PipelineOutcome, pipeline: &Pipeline) {
    let run = &outcome.run;
    println!("Run {} ({:?}, {} ms)", run.run_id, run.disposition, run.duration_ms());
    for record in &run.stages {
        let note = match record.status {
            StageStatus::Done if record.reused => " (reused)",
            _ => "",
        };
        println!("  {:<14} {:?}{}", record.stage.name(), record.status, note);
    }
    for warning in &run.warnings {
        println!("  warning: {warning}");
    }
    if outcome.is_done() && pipeline.layout().report_latest().is_file() {
        println!("Report: {}", pipeline.layout().report_latest().display());
    }
}

/// Print a failure to stderr and return its exit code.
fn report_error(error: &PipelineError) -> u8 {
    match error {
        PipelineError::StageExecution {
            stage,
            message,
            diagnostics,
        } => {
            eprintln!("error: stage '{stage}' failed: {message}");
            if let Some(diag) = diagnostics {
                eprintln!("{diag}");
            }
        }
        PipelineError::MissingPrerequisite { stage, .. } => {
            eprintln!("error: stage '{stage}' failed: {error}");
        }
        other => eprintln!("error: {other}"),
    }
    u8::try_from(error.exit_code()).unwrap_or(1)
}
