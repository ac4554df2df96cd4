use crate::detector::FaceDetector;
use crate::enroll::{self, EnrollConfig, EnrollError, ProfileHandle};
use crate::fusion::FusionEngine;
use crate::recognizer::EmbeddingProvider;
use crate::report::AnalysisReport;
use crate::scan::{CancelFlag, FrameSource, ScanConfig, ScanError, Scanner};
use crate::sinks::{ArtifactSink, ObservabilitySink, TracingObserver};
use image::GrayImage;
use std::sync::Arc;

/// Enrollment and scanning over one set of models.
///
/// Holds no profile of its own; callers keep the [`ProfileHandle`] and pass
/// it to each scan.
pub struct Analyzer {
    detector: Box<dyn FaceDetector>,
    engine: FusionEngine,
    enroll_config: EnrollConfig,
    artifacts: Option<Box<dyn ArtifactSink>>,
    observer: Box<dyn ObservabilitySink>,
}

impl Analyzer {
    pub fn new(detector: Box<dyn FaceDetector>, engine: FusionEngine) -> Self {
        Self {
            detector,
            engine,
            enroll_config: EnrollConfig::default(),
            artifacts: None,
            observer: Box::new(TracingObserver),
        }
    }

    pub fn with_enroll_config(mut self, config: EnrollConfig) -> Self {
        self.enroll_config = config;
        self
    }

    pub fn with_artifact_sink(mut self, sink: Box<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(sink);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn ObservabilitySink>) -> Self {
        self.observer = observer;
        self
    }

    pub fn engine(&self) -> &FusionEngine {
        &self.engine
    }

    fn embedder(&self) -> Option<&dyn EmbeddingProvider> {
        self.engine.embedder().map(|e| &**e)
    }

    /// Enroll the face in an encoded image (PNG, JPEG, ...).
    pub fn enroll(&self, image_bytes: &[u8]) -> Result<ProfileHandle, EnrollError> {
        enroll::enroll(image_bytes, self.detector.as_ref(), self.embedder(), &self.enroll_config).map(Arc::new)
    }

    pub fn enroll_image(&self, image: &GrayImage) -> Result<ProfileHandle, EnrollError> {
        enroll::enroll_image(image, self.detector.as_ref(), self.embedder(), &self.enroll_config).map(Arc::new)
    }

    pub fn scan(
        &self,
        source: &mut dyn FrameSource,
        profile: Option<&ProfileHandle>,
        config: &ScanConfig,
        cancel: &CancelFlag,
    ) -> Result<AnalysisReport, ScanError> {
        let scanner = Scanner {
            detector: self.detector.as_ref(),
            engine: &self.engine,
            artifacts: self.artifacts.as_deref(),
            observer: self.observer.as_ref(),
        };
        scanner.scan(source, profile, config, cancel)
    }
}
