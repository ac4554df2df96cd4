//! Face detection contract and an SCRFD implementation via ONNX Runtime.
//!
//! The scoring pipeline only depends on [`FaceDetector`]; [`ScrfdDetector`] is
//! the bundled backend (3-stride anchor decoding with NMS post-processing).

use crate::imaging;
use crate::types::BoundingBox;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

// Score threshold at the permissive neighbor count; each extra required
// neighbor raises it by one step.
const BASE_SCORE_THRESHOLD: f32 = 0.5;
const SCORE_STEP_PER_NEIGHBOR: f32 = 0.025;
const PERMISSIVE_NEIGHBORS: u32 = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection strictness.
///
/// `scale_factor` and `min_neighbors` follow the sliding-window detector
/// vocabulary; anchor-based backends map them onto their own knobs
/// (see [`DetectParams::score_threshold`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    pub scale_factor: f32,
    pub min_neighbors: u32,
    /// Minimum face width and height in pixels.
    pub min_size: u32,
}

impl DetectParams {
    /// Parameters for reference enrollment: few, confident detections.
    pub fn strict(min_size: u32) -> Self {
        Self {
            scale_factor: 1.2,
            min_neighbors: 8,
            min_size,
        }
    }

    /// Parameters for video frames: favor recall, scoring filters later.
    pub fn permissive(min_size: u32) -> Self {
        Self {
            scale_factor: 1.25,
            min_neighbors: PERMISSIVE_NEIGHBORS,
            min_size,
        }
    }

    /// Detection score an anchor-based detector requires at this strictness.
    pub fn score_threshold(&self) -> f32 {
        let extra = self.min_neighbors.saturating_sub(PERMISSIVE_NEIGHBORS) as f32;
        (BASE_SCORE_THRESHOLD + extra * SCORE_STEP_PER_NEIGHBOR).min(0.95)
    }
}

/// Locates faces in a grayscale image.
pub trait FaceDetector: Send + Sync {
    /// Returns zero or more boxes, all lying inside the image.
    fn detect(&self, image: &GrayImage, params: &DetectParams)
        -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Box in source-image coordinates before rounding, with its score.
#[derive(Debug, Clone, Copy)]
struct ScoredBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl ScoredBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn to_pixels(self, width: u32, height: u32) -> BoundingBox {
        let x0 = self.x1.max(0.0).round() as u32;
        let y0 = self.y1.max(0.0).round() as u32;
        let x1 = self.x2.max(0.0).round() as u32;
        let y1 = self.y2.max(0.0).round() as u32;
        BoundingBox::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
            .clipped(width, height)
    }
}

/// Letterbox resize metadata, for mapping detections back to the source image.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
        })
    }

    /// Letterbox a grayscale image into a normalized NCHW tensor.
    fn preprocess(image: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (image.width() as f32, image.height() as f32);
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width).min(size / height);

        let new_w = ((width * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let pad_x = (size - new_w as f32) / 2.0;
        let pad_y = (size - new_h as f32) / 2.0;

        let resized = imaging::resize_bilinear(image, new_w, new_h);
        let (x_start, y_start) = (pad_x.floor() as u32, pad_y.floor() as u32);

        // Padding stays at the mean, which normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (tx, ty) = ((x + x_start) as usize, (y + y_start) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = normalized;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &self,
        image: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(image);
        let threshold = params.score_threshold();

        let mut candidates = Vec::new();
        {
            let mut session = self
                .session
                .lock()
                .map_err(|_| DetectorError::InferenceFailed("detector session poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
                let (score_idx, bbox_idx) = self.stride_indices[pos];
                let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
                })?;
                let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
                })?;
                candidates.extend(decode_stride(scores, bboxes, stride, &letterbox, threshold));
            }
        }

        let boxes: Vec<BoundingBox> = nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(|b| b.to_pixels(image.width(), image.height()))
            .filter(|b| b.width >= params.min_size && b.height >= params.min_size)
            .collect();

        tracing::trace!(count = boxes.len(), threshold, "SCRFD detections");
        Ok(boxes)
    }
}

/// Map stride slots to output tensors.
///
/// Named exports ("score_8", "bbox_8", ...) are matched by name; anything else
/// uses the standard positional layout [scores 8/16/32, bboxes 8/16/32, kps ...].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[slot] = (s, b),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode one stride level into scored boxes in source-image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<ScoredBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied()?;
            if score <= threshold {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
            let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

            Some(ScoredBox {
                x1: unmap_x(cx - offsets[0] * s),
                y1: unmap_y(cy - offsets[1] * s),
                x2: unmap_x(cx + offsets[2] * s),
                y2: unmap_y(cy + offsets[3] * s),
                score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut boxes: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<ScoredBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &ScoredBox, b: &ScoredBox) -> f32 {
    let inter = ScoredBox {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
