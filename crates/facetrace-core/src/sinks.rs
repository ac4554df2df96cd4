//! Fire-and-forget side channels of a scan: debug artifacts and progress.
//!
//! Neither sink can influence a report. Implementations must swallow their own
//! failures.

use crate::scan::Frame;
use crate::types::BoundingBox;

/// Receives frames of interest for offline inspection.
pub trait ArtifactSink: Send + Sync {
    /// `label` is unique per candidate, e.g. `true_120_91` or `rejected_45_62`.
    fn record(&self, frame: &Frame, bbox: &BoundingBox, label: &str);
}

/// Which kind of candidate an artifact shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Match,
    Rejected,
}

impl ArtifactKind {
    pub fn label(self, frame: u64, confidence: f32) -> String {
        let prefix = match self {
            ArtifactKind::Match => "true",
            ArtifactKind::Rejected => "rejected",
        };
        format!("{prefix}_{frame}_{}", confidence as u32)
    }
}

/// Periodic scan progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub frames_seen: u64,
    /// Total frames in the source, when it knows.
    pub total_frames: Option<u64>,
    pub frames_analyzed: u64,
    pub faces_detected: u64,
    pub matches: usize,
}

impl ProgressEvent {
    pub fn percent(&self) -> Option<f64> {
        self.total_frames
            .filter(|&t| t > 0)
            .map(|t| self.frames_seen as f64 / t as f64 * 100.0)
    }
}

pub trait ObservabilitySink: Send + Sync {
    fn progress(&self, event: &ProgressEvent);
}

/// Logs progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ObservabilitySink for TracingObserver {
    fn progress(&self, event: &ProgressEvent) {
        tracing::info!(
            frames = event.frames_seen,
            total = ?event.total_frames,
            percent = ?event.percent().map(|p| (p * 10.0).round() / 10.0),
            analyzed = event.frames_analyzed,
            matches = event.matches,
            "scan progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_labels() {
        assert_eq!(ArtifactKind::Match.label(120, 91.75), "true_120_91");
        assert_eq!(ArtifactKind::Rejected.label(45, 62.2), "rejected_45_62");
    }

    #[test]
    fn test_progress_percent() {
        let event = ProgressEvent {
            frames_seen: 200,
            total_frames: Some(800),
            frames_analyzed: 14,
            faces_detected: 3,
            matches: 1,
        };
        assert_eq!(event.percent(), Some(25.0));
        assert_eq!(ProgressEvent { total_frames: None, ..event }.percent(), None);
        assert_eq!(ProgressEvent { total_frames: Some(0), ..event }.percent(), None);
    }
}
