//! Single-band floating point rasters.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tiff error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("unsupported raster sample format: {0}")]
    UnsupportedFormat(String),

    #[error("raster holds {actual} samples, expected {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        actual: usize,
    },
}

/// Row-major grid of NDVI values; NaN marks pixels without a value.
#[derive(Debug, Clone, PartialEq)]
pub struct NdviRaster {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// Statistics over the finite pixels of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NdviStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub valid_pixels: usize,
    pub total_pixels: usize,
}

impl NdviRaster {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, RasterError> {
        if data.len() != width as usize * height as usize {
            return Err(RasterError::DimensionMismatch {
                width,
                height,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Finite values in row-major order.
    pub fn finite_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().copied().filter(|v| v.is_finite())
    }

    /// `None` when the raster has no finite pixel.
    pub fn stats(&self) -> Option<NdviStats> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in self.finite_values() {
            let v = f64::from(v);
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        (count > 0).then(|| NdviStats {
            min,
            max,
            mean: sum / count as f64,
            valid_pixels: count,
            total_pixels: self.data.len(),
        })
    }

    /// Write as a single-band 32-bit float TIFF.
    pub fn write_tiff(&self, path: &Path) -> Result<(), RasterError> {
        let writer = BufWriter::new(File::create(path)?);
        let mut encoder = TiffEncoder::new(writer)?;
        encoder.write_image::<Gray32Float>(self.width, self.height, &self.data)?;
        Ok(())
    }

    /// Read a single-band TIFF. Integer samples are widened to f32.
    pub fn read_tiff(path: &Path) -> Result<Self, RasterError> {
        let reader = BufReader::new(File::open(path)?);
        let mut decoder = Decoder::new(reader)?;
        let (width, height) = decoder.dimensions()?;
        let data: Vec<f32> = match decoder.read_image()? {
            DecodingResult::F32(buf) => buf,
            DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
            DecodingResult::U8(buf) => buf.into_iter().map(f32::from).collect(),
            DecodingResult::U16(buf) => buf.into_iter().map(f32::from).collect(),
            DecodingResult::I16(buf) => buf.into_iter().map(f32::from).collect(),
            _ => {
                return Err(RasterError::UnsupportedFormat(
                    "expected 8/16-bit integer or float samples".to_string(),
                ))
            }
        };
        Self::new(width, height, data)
    }
}

/// Linearly interpolated percentile (`q` in 0..=100) of an ascending slice.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
