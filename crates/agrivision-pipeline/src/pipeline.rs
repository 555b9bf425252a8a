//! Run orchestration.
//!
//! A run walks the stage state machine `Resize -> Orthophoto -> Ndvi ->
//! GridClassify -> Report` under the project's run lock. A skipped stage must
//! find its own output already in place. The first failure ends the run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn, Instrument};

use agrivision_core::artifact::write_atomic;
use agrivision_core::obs::{
    emit_run_finished, emit_run_started, emit_stage_finished, emit_stage_skipped,
    emit_stage_started, emit_weather_unavailable, run_span,
};
use agrivision_core::run::{generate_run_id, validate_run_id};
use agrivision_core::{
    Disposition, PipelineError, PipelineRun, PipelineWarning, ProjectLayout, Result, RunConfig,
    RunState, SkipFlags, Stage, StageStatus, WeatherSnapshot,
};

use crate::engine::{OdmDockerEngine, PhotogrammetryEngine};
use crate::lock::RunLock;
use crate::runner::{run_stage, validate_skipped};
use crate::stages::{
    GridStage, NdviStage, OrthophotoStage, ReportStage, ResizeStage, StageContext, StageExecutor,
};
use crate::weather::{Architecture, ComposeLauncher, ServiceLauncher, WeatherService};

/// Stages a run will not execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipPlan {
    skipped: [bool; 5],
}

impl SkipPlan {
    /// Skipping NDVI also skips the grid, and skipping the grid skips the report.
    pub fn from_flags(flags: SkipFlags) -> Self {
        let grid = flags.grid || flags.ndvi;
        let report = flags.report || grid;
        Self {
            skipped: [flags.resize, flags.odm, flags.ndvi, grid, report],
        }
    }

    pub fn is_skipped(&self, stage: Stage) -> bool {
        Stage::ALL
            .iter()
            .position(|s| *s == stage)
            .map(|i| self.skipped[i])
            .unwrap_or(false)
    }
}

/// Shared interrupt flag, checked before each stage.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag on Ctrl-C until the returned task is aborted.
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping before the next stage");
                flag.cancel();
            }
        })
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit run id; a timestamp id is generated otherwise.
    pub run_id: Option<String>,
    /// Recompute stages even when their inputs are unchanged.
    pub force: bool,
    /// Do not contact the weather service.
    pub no_weather: bool,
}

/// How a run ended.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub run: PipelineRun,
    pub error: Option<PipelineError>,
}

impl PipelineOutcome {
    pub fn is_done(&self) -> bool {
        self.run.disposition == Disposition::Done
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, PipelineError::exit_code)
    }
}

pub struct Pipeline {
    config: Arc<RunConfig>,
    layout: ProjectLayout,
    engine: Arc<dyn PhotogrammetryEngine>,
    launcher: Arc<dyn ServiceLauncher>,
    architecture: Architecture,
    cancel: CancellationFlag,
}

impl Pipeline {
    pub fn new(project_root: impl Into<PathBuf>, config: RunConfig) -> Self {
        let layout = ProjectLayout::new(project_root, &config.paths);
        let engine = Arc::new(OdmDockerEngine::from_settings(&config.orthophoto));
        Self {
            config: Arc::new(config),
            layout,
            engine,
            launcher: Arc::new(ComposeLauncher),
            architecture: Architecture::detect(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn PhotogrammetryEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ServiceLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Flag that stops the run before its next stage when set.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    fn executor(&self, stage: Stage) -> Box<dyn StageExecutor> {
        match stage {
            Stage::Resize => Box::new(ResizeStage),
            Stage::Orthophoto => Box::new(OrthophotoStage::new(self.engine.clone())),
            Stage::Ndvi => Box::new(NdviStage),
            Stage::GridClassify => Box::new(GridStage),
            Stage::Report => Box::new(ReportStage),
        }
    }

    /// Execute one run.
    ///
    /// Returns `Err` only when the run could not start: an invalid run id,
    /// another live run holding the lock, or an unusable state directory.
    /// Stage failures and interrupts are reported in the outcome.
    pub async fn run(&self, options: RunOptions) -> Result<PipelineOutcome> {
        let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
        validate_run_id(&run_id)?;
        let span = run_span(&run_id);
        self.execute(run_id, options).instrument(span).await
    }

    async fn execute(&self, run_id: String, options: RunOptions) -> Result<PipelineOutcome> {
        let (lock, stale) = RunLock::acquire(&self.layout.lock_path(), &run_id)?;
        let listener = self.cancel.listen_for_ctrl_c();
        let started = Instant::now();

        let mut run = PipelineRun::new(&run_id);
        if let Some(warning) = stale {
            run.warn(warning);
        }
        emit_run_started(&run_id, self.layout.root());
        self.persist(&run);

        let plan = SkipPlan::from_flags(self.config.skip);
        let mut weather: Option<WeatherSnapshot> = None;
        let mut state = RunState::initial();
        let mut error = None;

        while let RunState::At(stage) = state {
            if self.cancel.is_cancelled() {
                error = Some(PipelineError::Interrupted {
                    before_stage: stage,
                });
                break;
            }
            match self
                .step(stage, &plan, &options, &mut run, &mut weather)
                .await
            {
                Ok(()) => state = state.advance(),
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Stage failed");
                    run.mark_failed(stage, e.to_string());
                    emit_stage_finished(
                        &run_id,
                        stage,
                        StageStatus::Failed,
                        run.record(stage).duration_ms.unwrap_or_default(),
                        false,
                    );
                    error = Some(e);
                    state = state.fail();
                }
            }
            self.persist(&run);
        }

        let disposition = match &error {
            None => Disposition::Done,
            Some(PipelineError::Interrupted { .. }) => Disposition::Interrupted,
            Some(_) => Disposition::Failed,
        };
        run.finish(disposition);
        self.persist(&run);
        emit_run_finished(&run_id, disposition, started.elapsed().as_millis() as u64);

        listener.abort();
        drop(lock);
        Ok(PipelineOutcome { run, error })
    }

    async fn step(
        &self,
        stage: Stage,
        plan: &SkipPlan,
        options: &RunOptions,
        run: &mut PipelineRun,
        weather: &mut Option<WeatherSnapshot>,
    ) -> Result<()> {
        let executor = self.executor(stage);
        let run_id = run.run_id.clone();

        if plan.is_skipped(stage) {
            let ctx = self.context(&run_id, None);
            let artifact = validate_skipped(executor.as_ref(), &ctx)?;
            emit_stage_skipped(&run_id, stage, &artifact.path);
            run.mark_skipped(stage, artifact);
            return Ok(());
        }

        if stage == Stage::Report {
            *weather = self.fetch_weather(options, run).await;
        }

        run.mark_running(stage);
        self.persist(run);
        emit_stage_started(&run_id, stage);

        let ctx = self.context(&run_id, weather.as_ref());
        let outcome = run_stage(executor.as_ref(), &ctx, options.force)
            .await
            .map_err(|e| match e {
                PipelineError::Io(io) => PipelineError::stage_execution(stage, io.to_string()),
                other => other,
            })?;
        let reused = outcome.reused;
        run.mark_done(stage, outcome.artifact, reused);
        emit_stage_finished(
            &run_id,
            stage,
            StageStatus::Done,
            run.record(stage).duration_ms.unwrap_or_default(),
            reused,
        );
        Ok(())
    }

    fn context<'a>(
        &'a self,
        run_id: &'a str,
        weather: Option<&'a WeatherSnapshot>,
    ) -> StageContext<'a> {
        StageContext {
            config: &self.config,
            layout: &self.layout,
            run_id,
            weather,
        }
    }

    async fn fetch_weather(
        &self,
        options: &RunOptions,
        run: &mut PipelineRun,
    ) -> Option<WeatherSnapshot> {
        let reason = if options.no_weather {
            "weather disabled for this run".to_string()
        } else {
            let service = WeatherService::new(
                &self.config.weather,
                self.config.location.as_ref(),
                self.layout.root(),
                self.layout.weather_marker(),
                self.architecture.clone(),
                self.launcher.clone(),
            );
            match service.ensure_ready_and_fetch().await {
                Ok(snapshot) => return Some(snapshot),
                Err(reason) => reason,
            }
        };
        emit_weather_unavailable(&run.run_id, &reason);
        run.warn(PipelineWarning::WeatherUnavailable(reason));
        None
    }

    /// Write the run record. Failures are logged, the run continues.
    fn persist(&self, run: &PipelineRun) {
        let path = self.layout.run_record(&run.run_id);
        let written = serde_json::to_vec_pretty(run)
            .map_err(std::io::Error::from)
            .and_then(|json| write_atomic(&path, &json));
        match written {
            Ok(()) => info!(path = %path.display(), disposition = ?run.disposition, "Run record saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to save run record"),
        }
    }
}
