//! Video scan controller.
//!
//! Pulls frames in order, analyzes every `sample_interval`-th frame, scores
//! each detected face against the reference profile and folds the outcomes
//! into an [`AnalysisReport`]. A scan is `Idle` until called, `Scanning` while
//! frames remain, and `Done` on exhaustion, cancellation or a configured limit;
//! every path to `Done` returns the report built so far.

use crate::detector::{DetectParams, FaceDetector};
use crate::enroll::{ProfileHandle, ReferenceProfile};
use crate::fusion::FusionEngine;
use crate::imaging;
use crate::report::{AnalysisReport, ReportBuilder, StopReason};
use crate::sinks::{ArtifactKind, ArtifactSink, ObservabilitySink, ProgressEvent};
use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frame rate assumed when the source reports none.
pub const DEFAULT_FPS: f64 = 25.0;

/// Rejections above this confidence are logged at info level.
const NEAR_MISS_CONFIDENCE: f32 = 50.0;

/// One decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Zero-based position in the video.
    pub index: u64,
    pub image: GrayImage,
}

#[derive(Error, Debug)]
pub enum FrameError {
    /// This frame is unusable; later frames may still be fine.
    #[error("frame {index} could not be decoded: {reason}")]
    Decode { index: u64, reason: String },
    /// The source itself failed; no more frames will follow.
    #[error("frame source failed: {0}")]
    Source(String),
}

/// A finite, non-restartable sequence of frames with increasing indices.
pub trait FrameSource: Send {
    /// Frames per second of the underlying video.
    fn fps(&self) -> f64;

    /// Total number of frames, when known up front.
    fn frame_count(&self) -> Option<u64> {
        None
    }

    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Option<Result<Frame, FrameError>>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("no reference face loaded")]
    NoReference,
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Analyze frames whose index is a multiple of this.
    pub sample_interval: u64,
    /// Minimum face width and height passed to the detector.
    pub min_face_size: u32,
    /// Margin added around detector boxes, as a fraction of the average side.
    pub crop_padding: f32,
    /// Rejections above this confidence are forwarded to the artifact sink.
    pub borderline_confidence: f32,
    /// Forward matches to the artifact sink.
    pub save_matches: bool,
    /// Emit a progress event every this many frames (0 disables).
    pub progress_every: u64,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
    /// Stop after this much wall-clock time, in seconds.
    pub max_seconds: Option<f64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sample_interval: 15,
            min_face_size: 90,
            crop_padding: 0.05,
            borderline_confidence: 40.0,
            save_matches: true,
            progress_every: 200,
            max_frames: None,
            max_seconds: None,
        }
    }
}

/// Cooperative cancellation shared between a scan and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Format seconds as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 { seconds as u64 } else { 0 };
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn is_near_miss(confidence: f32) -> bool {
    confidence > NEAR_MISS_CONFIDENCE
}

/// Collaborators for one scan.
pub struct Scanner<'a> {
    pub detector: &'a dyn FaceDetector,
    pub engine: &'a FusionEngine,
    pub artifacts: Option<&'a dyn ArtifactSink>,
    pub observer: &'a dyn ObservabilitySink,
}

impl Scanner<'_> {
    /// Scan `source` for the face in `profile`.
    ///
    /// The profile handle is cloned once, so the whole scan sees one profile
    /// even if the caller enrolls a new one meanwhile.
    pub fn scan(
        &self,
        source: &mut dyn FrameSource,
        profile: Option<&ProfileHandle>,
        config: &ScanConfig,
        cancel: &CancelFlag,
    ) -> Result<AnalysisReport, ScanError> {
        let profile = Arc::clone(profile.ok_or(ScanError::NoReference)?);

        let fps = match source.fps() {
            fps if fps.is_finite() && fps > 0.0 => fps,
            fps => {
                tracing::warn!(fps, fallback = DEFAULT_FPS, "source reports no usable frame rate");
                DEFAULT_FPS
            }
        };
        let interval = config.sample_interval.max(1);
        let total_frames = source.frame_count();
        let time_limit = config.max_seconds.and_then(|s| Duration::try_from_secs_f64(s).ok());

        tracing::info!(
            fps,
            total_frames = ?total_frames,
            interval,
            threshold = self.engine.threshold(),
            embedding = profile.embedding().is_some() && self.engine.embedder().is_some(),
            "starting video scan"
        );

        let started = Instant::now();
        let mut report = ReportBuilder::new(self.engine.threshold());
        let mut last_index: Option<u64> = None;

        let stop_reason = loop {
            if config.max_frames.is_some_and(|limit| report.frames_processed() >= limit) {
                break StopReason::FrameLimit;
            }

            let (index, frame) = match source.next_frame() {
                None => break StopReason::Exhausted,
                Some(Ok(frame)) => (frame.index, Some(frame)),
                Some(Err(FrameError::Decode { index, reason })) => {
                    tracing::warn!(frame = index, %reason, "unreadable frame, no candidates");
                    (index, None)
                }
                Some(Err(e @ FrameError::Source(_))) => {
                    if report.frames_processed() == 0 {
                        return Err(ScanError::SourceUnavailable(e.to_string()));
                    }
                    tracing::warn!(error = %e, "frame source failed, finishing scan");
                    break StopReason::Exhausted;
                }
            };

            if last_index.is_some_and(|prev| index <= prev) {
                tracing::warn!(frame = index, "out-of-order frame skipped");
                continue;
            }
            last_index = Some(index);
            report.frame_seen();

            if index % interval == 0 {
                if cancel.is_cancelled() {
                    break StopReason::Cancelled;
                }
                if time_limit.is_some_and(|limit| started.elapsed() >= limit) {
                    break StopReason::TimeLimit;
                }
                match &frame {
                    Some(frame) => self.analyze_frame(frame, &profile, fps, config, &mut report),
                    None => report.frame_analyzed(0),
                }
            }

            if config.progress_every > 0 && report.frames_processed() % config.progress_every == 0 {
                self.observer.progress(&ProgressEvent {
                    frames_seen: report.frames_processed(),
                    total_frames,
                    frames_analyzed: report.frames_analyzed(),
                    faces_detected: report.faces_detected(),
                    matches: report.match_count(),
                });
            }
        };

        let report = report.finish(stop_reason);
        tracing::info!(
            frames = report.total_frames_processed,
            analyzed = report.frames_analyzed,
            faces = report.total_faces_detected,
            matches = report.target_detections,
            rejected = report.rejected_detections,
            ?stop_reason,
            "scan finished"
        );
        Ok(report)
    }

    fn analyze_frame(
        &self,
        frame: &Frame,
        profile: &ReferenceProfile,
        fps: f64,
        config: &ScanConfig,
        report: &mut ReportBuilder,
    ) {
        let params = DetectParams::permissive(config.min_face_size);
        let faces = self.detector.detect(&frame.image, &params).unwrap_or_else(|e| {
            tracing::warn!(frame = frame.index, error = %e, "detection failed, no candidates");
            Vec::new()
        });
        report.frame_analyzed(faces.len());

        let (width, height) = frame.image.dimensions();
        let time = format_timestamp(frame.index as f64 / fps);

        // One record per frame: the best match wins, every match is forwarded.
        let mut best: Option<(f32, BoundingBox)> = None;

        for face in faces {
            let region = face.padded(config.crop_padding, width, height);
            let assessment = match imaging::crop(&frame.image, &region) {
                Some(crop) => self.engine.score(profile, &crop),
                None => {
                    tracing::debug!(frame = frame.index, ?face, "detection outside frame");
                    report.push_rejection();
                    continue;
                }
            };
            let confidence = assessment.confidence;

            if assessment.verdict.is_match() {
                tracing::info!(frame = frame.index, %time, confidence, "reference face matched");
                if best.map_or(true, |(c, _)| confidence > c) {
                    best = Some((confidence, region));
                }
                if config.save_matches {
                    self.forward(frame, &region, ArtifactKind::Match, confidence);
                }
            } else {
                report.push_rejection();
                if is_near_miss(confidence) {
                    tracing::info!(
                        frame = frame.index,
                        %time,
                        confidence,
                        need = self.engine.threshold(),
                        "near miss rejected"
                    );
                } else {
                    tracing::debug!(frame = frame.index, confidence, "candidate rejected");
                }
                if confidence > config.borderline_confidence {
                    self.forward(frame, &region, ArtifactKind::Rejected, confidence);
                }
            }
        }

        if let Some((confidence, region)) = best {
            report.push_match(time, confidence, frame.index, region);
        }
    }

    fn forward(&self, frame: &Frame, region: &BoundingBox, kind: ArtifactKind, confidence: f32) {
        if let Some(sink) = self.artifacts {
            sink.record(frame, region, &kind.label(frame.index, confidence));
        }
    }
}
