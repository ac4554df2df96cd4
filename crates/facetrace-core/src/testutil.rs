//! Deterministic fakes shared by the unit tests.

use crate::detector::{DetectParams, DetectorError, FaceDetector};
use crate::imaging;
use crate::recognizer::EmbeddingProvider;
use crate::scan::{CancelFlag, Frame, FrameError, FrameSource};
use crate::sinks::{ArtifactSink, ObservabilitySink, ProgressEvent};
use crate::types::{BoundingBox, Embedding};
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Blocky random texture with mild pixel noise. Never flat.
pub(crate) fn face_patch(seed: u64, width: u32, height: u32) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let blocks_x = width.div_ceil(4).max(1);
    let blocks_y = height.div_ceil(4).max(1);
    let levels: Vec<i32> = (0..blocks_x * blocks_y).map(|_| rng.gen_range(30..225)).collect();
    GrayImage::from_fn(width, height, |x, y| {
        let base = levels[((y / 4) * blocks_x + x / 4) as usize];
        Luma([(base + rng.gen_range(-6..=6)).clamp(0, 255) as u8])
    })
}

/// A gradient background with `face` pasted at `at`.
pub(crate) fn scene_with_face(face: &GrayImage, at: BoundingBox, width: u32, height: u32) -> GrayImage {
    let mut scene = GrayImage::from_fn(width, height, |x, y| Luma([(60 + (x + y) % 80) as u8]));
    image::imageops::replace(&mut scene, face, at.x as i64, at.y as i64);
    scene
}

pub(crate) fn inverted(img: &GrayImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| Luma([255 - img.get_pixel(x, y).0[0]]))
}

/// Mean-centred 8×8 thumbnail as an embedding. Identical crops give cosine 1,
/// inverted crops give about −1.
pub(crate) struct PixelEmbedder;

impl EmbeddingProvider for PixelEmbedder {
    fn embed(&self, crop: &GrayImage) -> Option<Embedding> {
        if crop.width() == 0 || crop.height() == 0 {
            return None;
        }
        let thumb = imaging::resize_bilinear(crop, 8, 8);
        let mean = thumb.as_raw().iter().map(|&p| p as f32).sum::<f32>() / 64.0;
        let raw = thumb.as_raw().iter().map(|&p| p as f32 - mean).collect();
        Embedding::normalized(raw, Some("pixel-8x8".into()))
    }
}

pub(crate) struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _crop: &GrayImage) -> Option<Embedding> {
        None
    }
}

/// Returns the same boxes for every image, or always fails.
pub(crate) struct FixedDetector {
    faces: Option<Vec<BoundingBox>>,
    calls: AtomicUsize,
    last_params: Mutex<Option<DetectParams>>,
    cancel_after: Option<(usize, CancelFlag)>,
}

impl FixedDetector {
    pub(crate) fn always(faces: Vec<BoundingBox>) -> Self {
        Self {
            faces: Some(faces),
            calls: AtomicUsize::new(0),
            last_params: Mutex::new(None),
            cancel_after: None,
        }
    }

    pub(crate) fn failing() -> Self {
        Self { faces: None, ..Self::always(Vec::new()) }
    }

    /// Raise `flag` once `calls` detections have run.
    pub(crate) fn cancel_after(mut self, calls: usize, flag: CancelFlag) -> Self {
        self.cancel_after = Some((calls, flag));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_params(&self) -> Option<DetectParams> {
        *self.last_params.lock().unwrap()
    }
}

impl FaceDetector for FixedDetector {
    fn detect(&self, _image: &GrayImage, params: &DetectParams) -> Result<Vec<BoundingBox>, DetectorError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_params.lock().unwrap() = Some(*params);
        if let Some((limit, flag)) = &self.cancel_after {
            if calls >= *limit {
                flag.cancel();
            }
        }
        self.faces
            .clone()
            .ok_or_else(|| DetectorError::InferenceFailed("scripted failure".into()))
    }
}

/// In-memory frame source.
pub(crate) struct VecFrameSource {
    frames: std::vec::IntoIter<Result<Frame, FrameError>>,
    fps: f64,
    known_length: Option<u64>,
    fail_at_end: bool,
}

impl VecFrameSource {
    pub(crate) fn from_results(frames: Vec<Result<Frame, FrameError>>) -> Self {
        Self {
            frames: frames.into_iter(),
            fps: 25.0,
            known_length: None,
            fail_at_end: false,
        }
    }

    pub(crate) fn blank_frames(count: u64, width: u32, height: u32) -> Vec<Frame> {
        (0..count)
            .map(|index| Frame { index, image: GrayImage::from_pixel(width, height, Luma([90])) })
            .collect()
    }

    pub(crate) fn blank(count: u64, width: u32, height: u32) -> Self {
        Self::from_results(Self::blank_frames(count, width, height).into_iter().map(Ok).collect())
    }

    /// `count` frames showing `face` at `at` where `shown(index)` holds and
    /// its inverse elsewhere.
    pub(crate) fn with_face(
        face: &GrayImage,
        at: BoundingBox,
        width: u32,
        height: u32,
        count: u64,
        shown: impl Fn(u64) -> bool,
    ) -> Self {
        let genuine = scene_with_face(face, at, width, height);
        let impostor = scene_with_face(&inverted(face), at, width, height);
        let frames = (0..count)
            .map(|index| {
                let image = if shown(index) { genuine.clone() } else { impostor.clone() };
                Ok(Frame { index, image })
            })
            .collect();
        Self::from_results(frames)
    }

    pub(crate) fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub(crate) fn with_known_length(mut self) -> Self {
        self.known_length = Some(self.frames.len() as u64);
        self
    }

    /// Fail with a source error instead of ending cleanly.
    pub(crate) fn then_fail(mut self) -> Self {
        self.fail_at_end = true;
        self
    }
}

impl FrameSource for VecFrameSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        self.known_length
    }

    fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        match self.frames.next() {
            Some(frame) => Some(frame),
            None if self.fail_at_end => {
                self.fail_at_end = false;
                Some(Err(FrameError::Source("stream ended unexpectedly".into())))
            }
            None => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct CollectingSink {
    labels: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub(crate) fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }
}

impl ArtifactSink for CollectingSink {
    fn record(&self, _frame: &Frame, _bbox: &BoundingBox, label: &str) {
        self.labels.lock().unwrap().push(label.to_string());
    }
}

#[derive(Default)]
pub(crate) struct CollectingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingObserver {
    pub(crate) fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ObservabilitySink for CollectingObserver {
    fn progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(*event);
    }
}
