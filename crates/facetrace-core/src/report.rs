use crate::types::BoundingBox;
use serde::{Deserialize, Serialize};

/// One high-confidence sighting of the reference face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// `HH:MM:SS` offset into the video.
    pub time: String,
    /// Fused confidence, rounded to two decimals.
    pub confidence: f32,
    pub frame: u64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// Why scanning stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// The frame source ran out (or failed to deliver the next frame).
    Exhausted,
    Cancelled,
    FrameLimit,
    TimeLimit,
}

/// Result of scanning one video against one reference profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub match_found: bool,
    /// Match records in increasing frame order.
    pub timestamps: Vec<MatchRecord>,
    /// Every frame pulled from the source, sampled or not.
    pub total_frames_processed: u64,
    /// Faces the detector returned on sampled frames.
    pub total_faces_detected: u64,
    pub target_detections: usize,
    pub rejected_detections: u64,
    pub confidence_threshold: f32,
    /// Frames that went through detection and scoring.
    pub frames_analyzed: u64,
    pub stop_reason: StopReason,
}

impl AnalysisReport {
    /// Highest confidence among the matches.
    pub fn best_match(&self) -> Option<&MatchRecord> {
        self.timestamps
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// Incrementally built report; only the scan controller appends to it.
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    threshold: f32,
    matches: Vec<MatchRecord>,
    frames_processed: u64,
    frames_analyzed: u64,
    faces_detected: u64,
    rejected: u64,
}

impl ReportBuilder {
    pub(crate) fn new(threshold: f32) -> Self {
        Self {
            threshold,
            matches: Vec::new(),
            frames_processed: 0,
            frames_analyzed: 0,
            faces_detected: 0,
            rejected: 0,
        }
    }

    pub(crate) fn frame_seen(&mut self) {
        self.frames_processed += 1;
    }

    pub(crate) fn frame_analyzed(&mut self, faces: usize) {
        self.frames_analyzed += 1;
        self.faces_detected += faces as u64;
    }

    pub(crate) fn push_match(&mut self, time: String, confidence: f32, frame: u64, bbox: BoundingBox) {
        debug_assert!(
            self.matches.last().map_or(true, |m| m.frame < frame),
            "match records must be strictly increasing by frame"
        );
        self.matches.push(MatchRecord {
            time,
            confidence: (confidence * 100.0).round() / 100.0,
            frame,
            bbox,
        });
    }

    pub(crate) fn push_rejection(&mut self) {
        self.rejected += 1;
    }

    pub(crate) fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub(crate) fn frames_analyzed(&self) -> u64 {
        self.frames_analyzed
    }

    pub(crate) fn faces_detected(&self) -> u64 {
        self.faces_detected
    }

    pub(crate) fn match_count(&self) -> usize {
        self.matches.len()
    }

    pub(crate) fn finish(self, stop_reason: StopReason) -> AnalysisReport {
        AnalysisReport {
            match_found: !self.matches.is_empty(),
            target_detections: self.matches.len(),
            timestamps: self.matches,
            total_frames_processed: self.frames_processed,
            total_faces_detected: self.faces_detected,
            rejected_detections: self.rejected,
            confidence_threshold: self.threshold,
            frames_analyzed: self.frames_analyzed,
            stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let mut builder = ReportBuilder::new(85.0);
        builder.frame_seen();
        builder.frame_analyzed(2);
        builder.push_match("00:00:00".into(), 91.756, 0, BoundingBox::new(1, 2, 3, 4));
        builder.push_rejection();
        let report = builder.finish(StopReason::Exhausted);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["matchFound"], true);
        assert_eq!(json["totalFramesProcessed"], 1);
        assert_eq!(json["totalFacesDetected"], 2);
        assert_eq!(json["targetDetections"], 1);
        assert_eq!(json["rejectedDetections"], 1);
        assert_eq!(json["confidenceThreshold"], 85.0);
        assert_eq!(json["stopReason"], "exhausted");
        assert_eq!(json["timestamps"][0]["box"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(json["timestamps"][0]["time"], "00:00:00");
        let confidence = json["timestamps"][0]["confidence"].as_f64().unwrap();
        assert!((confidence - 91.76).abs() < 1e-4);
    }

    #[test]
    fn test_empty_report() {
        let report = ReportBuilder::new(85.0).finish(StopReason::Cancelled);
        assert!(!report.match_found);
        assert_eq!(report.target_detections, 0);
        assert!(report.best_match().is_none());
    }

    #[test]
    fn test_best_match() {
        let mut builder = ReportBuilder::new(80.0);
        builder.push_match("00:00:01".into(), 82.0, 10, BoundingBox::new(0, 0, 1, 1));
        builder.push_match("00:00:02".into(), 95.0, 20, BoundingBox::new(0, 0, 1, 1));
        builder.push_match("00:00:03".into(), 88.0, 30, BoundingBox::new(0, 0, 1, 1));
        assert_eq!(builder.finish(StopReason::Exhausted).best_match().map(|m| m.frame), Some(20));
    }
}
