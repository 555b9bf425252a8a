//! AgriVision pipeline
//!
//! Runs one project from raw drone images to a report: stage executors,
//! adapters for the photogrammetry engine and the weather service, the run
//! lock and the orchestrator that ties them together.

pub mod engine;
pub mod lock;
pub mod pipeline;
pub mod process;
pub mod runner;
pub mod stages;
pub mod weather;

pub use engine::{EngineError, EngineRequest, OdmDockerEngine, PhotogrammetryEngine};
pub use lock::RunLock;
pub use pipeline::{CancellationFlag, Pipeline, PipelineOutcome, RunOptions, SkipPlan};
pub use stages::{StageContext, StageExecutor};
pub use weather::{Architecture, ComposeLauncher, ServiceLauncher, StartupRecipe, WeatherService};
