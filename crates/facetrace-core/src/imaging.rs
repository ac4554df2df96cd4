//! Grayscale pixel primitives: resize, equalization, blur, edges, cropping.
//!
//! All operations take and return [`GrayImage`] and are deterministic.

use crate::types::BoundingBox;
use image::GrayImage;

/// Resize with bilinear interpolation using pixel-center sampling.
pub fn resize_bilinear(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (sw, sh) = (src.width() as usize, src.height() as usize);
    if sw == width as usize && sh == height as usize {
        return src.clone();
    }

    let mut out = GrayImage::new(width, height);
    if sw == 0 || sh == 0 || width == 0 || height == 0 {
        return out;
    }

    let (w, h) = (width as usize, height as usize);
    let scale_x = sw as f32 / w as f32;
    let scale_y = sh as f32 / h as f32;
    let data = src.as_raw();
    let dst: &mut [u8] = &mut out;

    for y in 0..h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, sh as i32 - 1) as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, sw as i32 - 1) as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = data[y0 * sw + x0] as f32;
            let tr = data[y0 * sw + x1] as f32;
            let bl = data[y1 * sw + x0] as f32;
            let br = data[y1 * sw + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            dst[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Global histogram equalization.
///
/// Maps each intensity through the normalized CDF. Images with a single
/// intensity are returned unchanged.
pub fn equalize_histogram(src: &GrayImage) -> GrayImage {
    let data = src.as_raw();
    let total = data.len() as u64;
    if total == 0 {
        return src.clone();
    }

    let mut hist = [0u64; 256];
    for &p in data {
        hist[p as usize] += 1;
    }

    let mut cdf = [0u64; 256];
    let mut running = 0u64;
    for (i, &count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0);
    let denom = total - cdf_min;
    if denom == 0 {
        return src.clone();
    }

    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let scaled = (cdf[i].saturating_sub(cdf_min)) as f64 * 255.0 / denom as f64;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = src.clone();
    for p in out.iter_mut() {
        *p = lut[*p as usize];
    }
    out
}

/// 3×3 Gaussian blur (`[1 2 1; 2 4 2; 1 2 1] / 16`) with replicated borders.
pub fn gaussian_blur_3x3(src: &GrayImage) -> GrayImage {
    const KERNEL: [[u32; 3]; 3] = [[1, 2, 1], [2, 4, 2], [1, 2, 1]];

    let (w, h) = (src.width() as usize, src.height() as usize);
    let mut out = GrayImage::new(src.width(), src.height());
    if w == 0 || h == 0 {
        return out;
    }

    let data = src.as_raw();
    let dst: &mut [u8] = &mut out;
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (ky, row) in KERNEL.iter().enumerate() {
                let sy = clamp_index(y as isize + ky as isize - 1, h);
                for (kx, &weight) in row.iter().enumerate() {
                    let sx = clamp_index(x as isize + kx as isize - 1, w);
                    acc += weight * data[sy * w + sx] as u32;
                }
            }
            dst[y * w + x] = ((acc + 8) / 16) as u8;
        }
    }
    out
}

/// Mean Sobel gradient magnitude, each pixel's magnitude capped at 255.
pub fn sobel_magnitude_mean(src: &GrayImage) -> f32 {
    let (w, h) = (src.width() as usize, src.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }

    let data = src.as_raw();
    let at = |x: isize, y: isize| -> f32 {
        data[clamp_index(y, h) * w + clamp_index(x, w)] as f32
    };

    let mut sum = 0.0f64;
    for y in 0..h as isize {
        for x in 0..w as isize {
            let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            sum += (gx * gx + gy * gy).sqrt().min(255.0) as f64;
        }
    }

    (sum / (w * h) as f64) as f32
}

/// Population mean and standard deviation of the pixel intensities.
pub fn mean_and_std(src: &GrayImage) -> (f32, f32) {
    let data = src.as_raw();
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let mean = data.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = data.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, variance.sqrt() as f32)
}

/// Copy the region under `bbox`, clipped to the image. Zero-area regions yield `None`.
pub fn crop(src: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let region = bbox.clipped(src.width(), src.height());
    if region.is_empty() {
        return None;
    }
    Some(image::imageops::crop_imm(src, region.x, region.y, region.width, region.height).to_image())
}

fn clamp_index(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}
