//! Classical face descriptor: intensity histogram, edge density and texture.
//!
//! Every descriptor is computed from the canonical form of a crop: resized to
//! 100×100, histogram-equalized, then blurred with a 3×3 Gaussian.

use crate::imaging;
use crate::types::cosine_similarity;
use image::GrayImage;
use thiserror::Error;

/// Side length of the canonical crop.
pub const CANONICAL_SIZE: u32 = 100;
pub const HISTOGRAM_BINS: usize = 256;
/// Histogram bins + edge density + texture.
pub const DESCRIPTOR_LEN: usize = HISTOGRAM_BINS + 2;

const MIN_NORM: f32 = 1e-6;
// Std-dev of 8-bit data is at most 127.5, so texture stays below ~1.3.
const TEXTURE_SCALE: f32 = 100.0;

/// Why a crop produced no usable descriptor.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degenerate {
    #[error("crop has zero area")]
    EmptyCrop,
    #[error("crop has a single intensity")]
    FlatCrop,
    #[error("descriptor contains non-finite values")]
    NonFinite,
    #[error("descriptor norm is near zero")]
    ZeroNorm,
}

/// Fixed-length descriptor of a face crop. Never NaN, never near-zero norm.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn histogram(&self) -> &[f32] {
        &self.values[..HISTOGRAM_BINS]
    }

    pub fn edge_density(&self) -> f32 {
        self.values[HISTOGRAM_BINS]
    }

    pub fn texture(&self) -> f32 {
        self.values[HISTOGRAM_BINS + 1]
    }

    /// Cosine similarity in [-1, 1].
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Resize, equalize and blur a crop into its canonical 100×100 form.
pub fn canonicalize(crop: &GrayImage) -> GrayImage {
    let resized = imaging::resize_bilinear(crop, CANONICAL_SIZE, CANONICAL_SIZE);
    let equalized = imaging::equalize_histogram(&resized);
    imaging::gaussian_blur_3x3(&equalized)
}

/// Extract the descriptor of a grayscale face crop.
pub fn extract(crop: &GrayImage) -> Result<Descriptor, Degenerate> {
    if crop.width() == 0 || crop.height() == 0 {
        return Err(Degenerate::EmptyCrop);
    }
    let first = crop.as_raw()[0];
    if crop.as_raw().iter().all(|&p| p == first) {
        return Err(Degenerate::FlatCrop);
    }

    let canonical = canonicalize(crop);

    let mut histogram = vec![0.0f32; HISTOGRAM_BINS];
    for &p in canonical.as_raw() {
        histogram[p as usize] += 1.0;
    }
    let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > MIN_NORM {
        for v in histogram.iter_mut() {
            *v /= norm;
        }
    }

    let edge_density = imaging::sobel_magnitude_mean(&canonical);
    let (_, std_dev) = imaging::mean_and_std(&canonical);

    let mut values = histogram;
    values.reserve(2);
    values.push(edge_density);
    values.push(std_dev / TEXTURE_SCALE);

    if values.iter().any(|v| !v.is_finite()) {
        return Err(Degenerate::NonFinite);
    }
    if values.iter().map(|v| v * v).sum::<f32>().sqrt() <= MIN_NORM {
        return Err(Degenerate::ZeroNorm);
    }

    Ok(Descriptor { values })
}
