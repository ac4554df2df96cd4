use facetrace_core::{
    AnalysisReport, Analyzer, BoundingBox, CancelFlag, EnrollError, FrameSource, ProfileHandle, ScanConfig,
    ScanError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),
    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// What was enrolled, as printed by `facetrace enroll`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollSummary {
    #[serde(rename = "box")]
    pub source_box: BoundingBox,
    pub descriptor_len: usize,
    pub has_embedding: bool,
    pub embedding_model: Option<String>,
}

impl EnrollSummary {
    fn of(profile: &ProfileHandle) -> Self {
        Self {
            source_box: profile.source_box(),
            descriptor_len: profile.descriptor().len(),
            has_embedding: profile.embedding().is_some(),
            embedding_model: profile.embedding().and_then(|e| e.model_version.clone()),
        }
    }
}

/// Messages sent from the CLI to the engine thread.
enum EngineRequest {
    Enroll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollSummary, EngineError>>,
    },
    Scan {
        source: Box<dyn FrameSource>,
        config: ScanConfig,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<AnalysisReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Enroll a reference image and make it the active profile.
    ///
    /// A failed enrollment leaves the previous profile active.
    pub async fn enroll(&self, image: Vec<u8>) -> Result<EnrollSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Scan `source` against the profile active when the request is picked up.
    pub async fn scan(
        &self,
        source: Box<dyn FrameSource>,
        config: ScanConfig,
        cancel: CancelFlag,
    ) -> Result<AnalysisReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Scan {
                source,
                config,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Model inference and frame decoding are blocking, so they stay off the
/// async runtime. The thread owns the active profile slot; each scan takes its
/// own handle to the profile, so a later enrollment cannot change it mid-scan.
pub fn spawn_engine(analyzer: Analyzer) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facetrace-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut active: Option<ProfileHandle> = None;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { image, reply } => {
                        let result = match analyzer.enroll(&image) {
                            Ok(profile) => {
                                let summary = EnrollSummary::of(&profile);
                                active = Some(profile);
                                Ok(summary)
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, kept_previous = active.is_some(), "enrollment rejected");
                                Err(e.into())
                            }
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Scan {
                        mut source,
                        config,
                        cancel,
                        reply,
                    } => {
                        let snapshot = active.clone();
                        let result = analyzer
                            .scan(source.as_mut(), snapshot.as_ref(), &config, &cancel)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrace_core::detector::{DetectParams, DetectorError};
    use facetrace_core::{FaceDetector, Frame, FrameError, FusionEngine, StopReason};
    use image::{GrayImage, Luma};
    use std::io::Cursor;

    const FACE: BoundingBox = BoundingBox { x: 40, y: 30, width: 100, height: 100 };

    /// Reports `FACE` on every image.
    struct StaticDetector;

    impl FaceDetector for StaticDetector {
        fn detect(&self, _image: &GrayImage, _params: &DetectParams) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![FACE])
        }
    }

    fn scene(seed: u32) -> GrayImage {
        GrayImage::from_fn(200, 160, |x, y| {
            let v = (x / 5 * 31 + y / 5 * 17 + seed * 101) % 190;
            Luma([(v + 30) as u8])
        })
    }

    fn png(img: &GrayImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    struct Frames(std::vec::IntoIter<GrayImage>, u64);

    impl Frames {
        fn of(images: Vec<GrayImage>) -> Box<dyn FrameSource> {
            Box::new(Frames(images.into_iter(), 0))
        }
    }

    impl FrameSource for Frames {
        fn fps(&self) -> f64 {
            25.0
        }

        fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
            let image = self.0.next()?;
            let index = self.1;
            self.1 += 1;
            Some(Ok(Frame { index, image }))
        }
    }

    fn engine() -> EngineHandle {
        // classical signals alone reach 75 on an identical crop
        let analyzer = Analyzer::new(Box::new(StaticDetector), FusionEngine::new(70.0));
        spawn_engine(analyzer).unwrap()
    }

    fn unpadded() -> ScanConfig {
        ScanConfig { sample_interval: 1, crop_padding: 0.0, ..ScanConfig::default() }
    }

    #[tokio::test]
    async fn test_scan_before_enroll() {
        let handle = engine();
        let err = handle.scan(Frames::of(vec![scene(1)]), unpadded(), CancelFlag::new()).await;
        assert!(matches!(err, Err(EngineError::Scan(ScanError::NoReference))));
    }

    #[tokio::test]
    async fn test_enroll_then_scan() {
        let handle = engine();
        let summary = handle.enroll(png(&scene(1))).await.unwrap();
        assert_eq!(summary.source_box, FACE);
        assert_eq!(summary.descriptor_len, 258);
        assert!(!summary.has_embedding);

        let report = handle
            .scan(Frames::of(vec![scene(1), scene(2), scene(1)]), unpadded(), CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Exhausted);
        assert_eq!(report.timestamps.iter().map(|m| m.frame).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_failed_enroll_keeps_previous_profile() {
        let handle = engine();
        handle.enroll(png(&scene(1))).await.unwrap();

        let err = handle.enroll(b"not an image".to_vec()).await;
        assert!(matches!(err, Err(EngineError::Enroll(EnrollError::ImageUnreadable(_)))));

        let report = handle.scan(Frames::of(vec![scene(1)]), unpadded(), CancelFlag::new()).await.unwrap();
        assert!(report.match_found);
    }

    #[tokio::test]
    async fn test_reenroll_replaces_profile() {
        let handle = engine();
        handle.enroll(png(&scene(1))).await.unwrap();
        handle.enroll(png(&scene(2))).await.unwrap();

        let report = handle
            .scan(Frames::of(vec![scene(1), scene(2)]), unpadded(), CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.timestamps.iter().map(|m| m.frame).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_cancelled_scan_is_partial() {
        let handle = engine();
        handle.enroll(png(&scene(1))).await.unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = handle.scan(Frames::of(vec![scene(1); 5]), unpadded(), cancel).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.frames_analyzed, 0);
        assert!(!report.match_found);
    }
}
