//! NDVI computation and colour preview.

use image::{DynamicImage, Rgb, RgbImage};

use crate::config::CameraBands;
use crate::raster::{percentile, NdviRaster, RasterError};

/// Colour used for pixels without a value.
pub const NO_DATA_COLOR: Rgb<u8> = Rgb([0x3a, 0x3a, 0x3a]);

const RAMP_LOW: [f64; 3] = [215.0, 48.0, 39.0];
const RAMP_MID: [f64; 3] = [255.0, 255.0, 191.0];
const RAMP_HIGH: [f64; 3] = [26.0, 152.0, 80.0];

#[derive(Debug, thiserror::Error)]
pub enum NdviError {
    #[error("band '{band}' maps to channel {index} but the image has {channels} channel(s)")]
    ChannelOutOfRange {
        band: &'static str,
        index: usize,
        channels: usize,
    },

    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// `(nir - red) / (nir + red)`, NaN when the denominator is zero.
pub fn ndvi_value(red: f32, nir: f32) -> f32 {
    let denom = nir + red;
    if denom == 0.0 {
        f32::NAN
    } else {
        (nir - red) / denom
    }
}

/// Compute the NDVI raster of an orthophoto.
///
/// Band indices come from the camera mapping and refer to the image's
/// channels in storage order. When the image has an alpha channel that is not
/// itself mapped to a band, fully transparent pixels become NaN.
pub fn compute_ndvi(image: &DynamicImage, bands: &CameraBands) -> Result<NdviRaster, NdviError> {
    let color = image.color();
    let channels = usize::from(color.channel_count());
    let red = bands.red();
    let nir = bands.nir();
    for (band, index) in [("red", red), ("nir", nir)] {
        if index >= channels {
            return Err(NdviError::ChannelOutOfRange {
                band,
                index,
                channels,
            });
        }
    }

    let samples: Vec<f32> = match channels {
        1 => image.to_luma32f().into_raw(),
        2 => image.to_luma_alpha32f().into_raw(),
        3 => image.to_rgb32f().into_raw(),
        _ => image.to_rgba32f().into_raw(),
    };
    let alpha = (color.has_alpha())
        .then_some(channels - 1)
        .filter(|a| *a != red && *a != nir);

    let data = samples
        .chunks_exact(channels)
        .map(|px| match alpha {
            Some(a) if px[a] == 0.0 => f32::NAN,
            _ => ndvi_value(px[red], px[nir]),
        })
        .collect();

    Ok(NdviRaster::new(image.width(), image.height(), data)?)
}

/// Value range mapped onto the colour ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stretch {
    pub low: f64,
    pub high: f64,
}

impl Stretch {
    /// 2nd to 98th percentile of the finite pixels, widened when flat.
    pub fn for_raster(raster: &NdviRaster) -> Self {
        let mut values: Vec<f64> = raster.finite_values().map(f64::from).collect();
        values.sort_by(f64::total_cmp);
        let (low, high) = match (percentile(&values, 2.0), percentile(&values, 98.0)) {
            (Some(low), Some(high)) => (low, high),
            _ => (-1.0, 1.0),
        };
        if high - low < 1e-6 {
            return Self {
                low: low - 0.05,
                high: high + 0.05,
            };
        }
        Self { low, high }
    }

    pub fn color(&self, value: f32) -> Rgb<u8> {
        if !value.is_finite() {
            return NO_DATA_COLOR;
        }
        let t = ((f64::from(value) - self.low) / (self.high - self.low)).clamp(0.0, 1.0);
        ramp(t)
    }
}

/// Red to yellow to green ramp for `t` in `0..=1`.
pub fn ramp(t: f64) -> Rgb<u8> {
    let (from, to, f) = if t < 0.5 {
        (RAMP_LOW, RAMP_MID, t * 2.0)
    } else {
        (RAMP_MID, RAMP_HIGH, (t - 0.5) * 2.0)
    };
    let lerp = |i: usize| (from[i] + (to[i] - from[i]) * f).round() as u8;
    Rgb([lerp(0), lerp(1), lerp(2)])
}

/// Colour visualisation of an NDVI raster.
pub fn render_preview(raster: &NdviRaster) -> RgbImage {
    let stretch = Stretch::for_raster(raster);
    RgbImage::from_fn(raster.width, raster.height, |x, y| {
        stretch.color(raster.get(x, y))
    })
}
