//! Grid health classification of an NDVI raster.
//!
//! The raster extent is split into `rows x cols` cells with edges at
//! `floor(i * extent / n)`. Each cell's mean NDVI is mapped onto the configured
//! thresholds with inclusive lower bounds: the class index is the number of
//! thresholds less than or equal to the mean.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::config::{GridSize, NdviSettings};
use crate::ndvi::{ramp, render_preview, NO_DATA_COLOR};
use crate::raster::{percentile, NdviRaster};

/// Label used for cells without data.
pub const NO_DATA_LABEL: &str = "no_data";

/// Health class of a grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    /// Index into the class list, `0` being the lowest.
    Class(usize),
    /// The cell covers no finite NDVI pixel.
    NoData,
}

impl HealthClass {
    pub fn index(&self) -> Option<usize> {
        match self {
            HealthClass::Class(i) => Some(*i),
            HealthClass::NoData => None,
        }
    }
}

/// Map one value onto strictly increasing thresholds.
pub fn classify_value(thresholds: &[f64], value: f64) -> HealthClass {
    if !value.is_finite() {
        return HealthClass::NoData;
    }
    HealthClass::Class(thresholds.partition_point(|t| *t <= value))
}

/// Spreadsheet-style row letters: 0 -> `A`, 25 -> `Z`, 26 -> `AA`.
pub fn row_label(row: u32) -> String {
    let mut n = row as u64 + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push(b'A' + rem);
        n = (n - 1) / 26;
    }
    letters.iter().rev().map(|b| *b as char).collect()
}

/// Identifier of the cell at `row`, `col` (0-based), e.g. `B3`.
pub fn cell_id(row: u32, col: u32) -> String {
    format!("{}{}", row_label(row), col + 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub row: u32,
    pub col: u32,
    pub cell_id: String,
    pub mean_ndvi: Option<f64>,
    pub health: HealthClass,
    /// Finite pixels contributing to the mean.
    pub pixel_count: usize,
}

/// All cells of one classification, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridClassification {
    pub rows: u32,
    pub cols: u32,
    pub cells: Vec<GridCell>,
    /// Thresholds the classes were assigned with.
    pub thresholds_used: Vec<f64>,
    pub class_labels: Vec<String>,
    /// True when thresholds were re-derived from cell percentiles.
    pub dynamic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCount {
    pub label: String,
    pub count: usize,
}

/// Aggregates over the cells that have data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSummary {
    pub classes: Vec<ClassCount>,
    pub data_cells: usize,
    pub no_data_cells: usize,
    pub mean_ndvi: Option<f64>,
}

fn edge(i: u32, extent: u32, n: u32) -> u32 {
    ((i as u64 * extent as u64) / n as u64) as u32
}

/// Classify `raster` into `grid` cells.
pub fn classify_grid(
    raster: &NdviRaster,
    grid: GridSize,
    settings: &NdviSettings,
) -> GridClassification {
    let (rows, cols) = (grid.rows(), grid.cols());
    let thresholds = settings.thresholds.as_slice().to_vec();
    let mut cells = Vec::with_capacity(grid.cell_count());

    for row in 0..rows {
        let (y0, y1) = (edge(row, raster.height, rows), edge(row + 1, raster.height, rows));
        for col in 0..cols {
            let (x0, x1) = (edge(col, raster.width, cols), edge(col + 1, raster.width, cols));
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for y in y0..y1 {
                for x in x0..x1 {
                    let v = raster.get(x, y);
                    if v.is_finite() {
                        sum += f64::from(v);
                        count += 1;
                    }
                }
            }
            let mean_ndvi = (count > 0).then(|| sum / count as f64);
            cells.push(GridCell {
                row,
                col,
                cell_id: cell_id(row, col),
                mean_ndvi,
                health: mean_ndvi.map_or(HealthClass::NoData, |m| classify_value(&thresholds, m)),
                pixel_count: count,
            });
        }
    }

    let mut classification = GridClassification {
        rows,
        cols,
        cells,
        thresholds_used: thresholds,
        class_labels: settings.class_labels.clone(),
        dynamic: false,
    };
    if settings.dynamic_fallback {
        classification.apply_dynamic_fallback();
    }
    classification
}

impl GridClassification {
    /// Re-derive thresholds from the data-cell means when every data cell
    /// landed in the same class. Kept only when the derived thresholds are
    /// strictly increasing.
    fn apply_dynamic_fallback(&mut self) {
        let mut means: Vec<f64> = self.cells.iter().filter_map(|c| c.mean_ndvi).collect();
        if means.len() < 2 {
            return;
        }
        let first = self.cells.iter().find_map(|c| c.health.index());
        if !self.cells.iter().all(|c| c.health.index().is_none() || c.health.index() == first) {
            return;
        }
        means.sort_by(f64::total_cmp);
        let n = self.thresholds_used.len();
        let derived: Vec<f64> = (1..=n)
            .filter_map(|k| percentile(&means, 100.0 * k as f64 / (n + 1) as f64))
            .collect();
        if derived.len() != n || derived.windows(2).any(|w| w[0] >= w[1]) {
            return;
        }
        for cell in &mut self.cells {
            if let Some(mean) = cell.mean_ndvi {
                cell.health = classify_value(&derived, mean);
            }
        }
        self.thresholds_used = derived;
        self.dynamic = true;
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&GridCell> {
        self.cells.get(row as usize * self.cols as usize + col as usize)
    }

    pub fn label(&self, health: HealthClass) -> &str {
        match health {
            HealthClass::Class(i) => self
                .class_labels
                .get(i)
                .map(String::as_str)
                .unwrap_or("unknown"),
            HealthClass::NoData => NO_DATA_LABEL,
        }
    }

    pub fn summary(&self) -> GridSummary {
        let mut counts = vec![0usize; self.class_labels.len()];
        let mut sum = 0.0;
        let mut data_cells = 0;
        for cell in &self.cells {
            if let (Some(i), Some(mean)) = (cell.health.index(), cell.mean_ndvi) {
                if let Some(slot) = counts.get_mut(i) {
                    *slot += 1;
                }
                sum += mean;
                data_cells += 1;
            }
        }
        GridSummary {
            classes: self
                .class_labels
                .iter()
                .zip(counts)
                .map(|(label, count)| ClassCount {
                    label: label.clone(),
                    count,
                })
                .collect(),
            data_cells,
            no_data_cells: self.cells.len() - data_cells,
            mean_ndvi: (data_cells > 0).then(|| sum / data_cells as f64),
        }
    }

    /// One line per cell: `cell_id,row_label,col_label,mean_ndvi,class`.
    pub fn cells_csv(&self) -> String {
        let mut out = String::from("cell_id,row_label,col_label,mean_ndvi,class\n");
        for cell in &self.cells {
            let mean = cell.mean_ndvi.map(|m| format!("{m:.4}")).unwrap_or_default();
            let line = [
                csv_field(&cell.cell_id),
                csv_field(&row_label(cell.row)),
                (cell.col + 1).to_string(),
                mean,
                csv_field(self.label(cell.health)),
            ]
            .join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// One column per class plus `no_data`, each listing its cell ids.
    pub fn categories_csv(&self) -> String {
        let mut columns: Vec<Vec<&str>> = vec![Vec::new(); self.class_labels.len() + 1];
        for cell in &self.cells {
            let slot = cell.health.index().unwrap_or(self.class_labels.len());
            if let Some(column) = columns.get_mut(slot) {
                column.push(&cell.cell_id);
            }
        }
        let header: Vec<String> = self
            .class_labels
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(NO_DATA_LABEL))
            .map(csv_field)
            .collect();
        let mut out = header.join(",");
        out.push('\n');
        let depth = columns.iter().map(Vec::len).max().unwrap_or(0);
        for i in 0..depth {
            let row: Vec<String> = columns
                .iter()
                .map(|c| c.get(i).map(|id| csv_field(id)).unwrap_or_default())
                .collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// Colour of a class marker on the overlay.
    pub fn class_color(&self, health: HealthClass) -> Rgb<u8> {
        match health {
            HealthClass::Class(i) => {
                let top = self.class_labels.len().saturating_sub(1).max(1);
                ramp(i as f64 / top as f64)
            }
            HealthClass::NoData => NO_DATA_COLOR,
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// NDVI preview with grid lines and a class-coloured marker in each cell.
pub fn render_overlay(raster: &NdviRaster, classification: &GridClassification) -> RgbImage {
    const LINE: Rgb<u8> = Rgb([255, 255, 255]);
    let mut img = render_preview(raster);
    let (w, h) = (raster.width, raster.height);
    if w == 0 || h == 0 {
        return img;
    }
    let (rows, cols) = (classification.rows, classification.cols);

    for r in 1..rows {
        let y = edge(r, h, rows).min(h - 1);
        for x in 0..w {
            img.put_pixel(x, y, LINE);
        }
    }
    for c in 1..cols {
        let x = edge(c, w, cols).min(w - 1);
        for y in 0..h {
            img.put_pixel(x, y, LINE);
        }
    }

    for cell in &classification.cells {
        let (x0, x1) = (edge(cell.col, w, cols), edge(cell.col + 1, w, cols));
        let (y0, y1) = (edge(cell.row, h, rows), edge(cell.row + 1, h, rows));
        if x1 <= x0 || y1 <= y0 {
            continue;
        }
        let half = ((x1 - x0).min(y1 - y0) / 8).max(1);
        let (cx, cy) = ((x0 + x1) / 2, (y0 + y1) / 2);
        let color = classification.class_color(cell.health);
        for y in cy.saturating_sub(half)..(cy + half).min(h) {
            for x in cx.saturating_sub(half)..(cx + half).min(w) {
                img.put_pixel(x, y, color);
            }
        }
    }
    img
}
