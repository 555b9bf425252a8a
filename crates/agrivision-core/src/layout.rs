//! Project directory layout.

use std::path::{Path, PathBuf};

use crate::config::PathsConfig;

/// Resolved locations of every input, artifact and state file of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
    paths: PathsConfig,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>, paths: &PathsConfig) -> Self {
        Self {
            root: root.into(),
            paths: paths.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn join(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    pub fn raw_images(&self) -> PathBuf {
        self.join(&self.paths.raw_images)
    }

    pub fn resized_images(&self) -> PathBuf {
        self.join(&self.paths.resized_images)
    }

    pub fn odm_root(&self) -> PathBuf {
        self.join(&self.paths.odm_project)
    }

    /// Name of the engine project inside [`Self::odm_root`].
    pub const ODM_PROJECT: &'static str = "project";

    pub fn odm_project(&self) -> PathBuf {
        self.odm_root().join(Self::ODM_PROJECT)
    }

    pub fn orthophoto(&self) -> PathBuf {
        orthophoto_in(&self.odm_project())
    }

    pub fn ndvi_dir(&self) -> PathBuf {
        self.join(&self.paths.ndvi_output)
    }

    pub fn ndvi_raster(&self) -> PathBuf {
        self.ndvi_dir().join(NDVI_RASTER)
    }

    pub fn ndvi_preview(&self) -> PathBuf {
        self.ndvi_dir().join(NDVI_PREVIEW)
    }

    pub fn grid_dir(&self) -> PathBuf {
        self.join(&self.paths.grid_output)
    }

    pub fn grid_cells_json(&self) -> PathBuf {
        self.grid_dir().join(GRID_CELLS_JSON)
    }

    pub fn grid_cells_csv(&self) -> PathBuf {
        self.grid_dir().join(GRID_CELLS_CSV)
    }

    pub fn grid_categories_csv(&self) -> PathBuf {
        self.grid_dir().join(GRID_CATEGORIES_CSV)
    }

    pub fn grid_overlay(&self) -> PathBuf {
        self.grid_dir().join(GRID_OVERLAY)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.join(&self.paths.reports)
    }

    pub fn report_latest(&self) -> PathBuf {
        self.reports_dir().join(REPORT_LATEST)
    }

    pub fn run_report_dir(&self, run_id: &str) -> PathBuf {
        self.reports_dir().join("runs").join(run_id)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.join(&self.paths.state)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("run.lock")
    }

    pub fn weather_marker(&self) -> PathBuf {
        self.state_dir().join("weather-start.marker")
    }

    pub fn run_record(&self, run_id: &str) -> PathBuf {
        self.state_dir().join("runs").join(format!("{run_id}.json"))
    }
}

pub const ORTHOPHOTO: &str = "odm_orthophoto.tif";
pub const NDVI_RASTER: &str = "ndvi.tif";
pub const NDVI_PREVIEW: &str = "ndvi_color.png";
pub const GRID_CELLS_JSON: &str = "grid_cells.json";
pub const GRID_CELLS_CSV: &str = "ndvi_grid_cells.csv";
pub const GRID_CATEGORIES_CSV: &str = "ndvi_grid_categories.csv";
pub const GRID_OVERLAY: &str = "ndvi_grid_overlay.png";
pub const REPORT_LATEST: &str = "report_latest.html";
pub const REPORT_FILE: &str = "report.html";

/// Orthophoto location inside an engine project directory.
pub fn orthophoto_in(project: &Path) -> PathBuf {
    project.join("odm_orthophoto").join(ORTHOPHOTO)
}
