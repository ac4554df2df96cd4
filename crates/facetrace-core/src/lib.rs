//! facetrace-core: find one person's face in a video.
//!
//! A reference image is enrolled into a [`ReferenceProfile`]. A scan then
//! samples video frames, detects faces with SCRFD, and scores each candidate
//! against the profile by fusing classical descriptor signals with an
//! optional ArcFace embedding. Models run through ONNX Runtime on the CPU.

pub mod analyzer;
pub mod descriptor;
pub mod detector;
pub mod enroll;
pub mod fusion;
pub mod imaging;
pub mod recognizer;
pub mod report;
pub mod scan;
pub mod sinks;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use analyzer::Analyzer;
pub use descriptor::{Degenerate, Descriptor};
pub use detector::{DetectParams, DetectorError, FaceDetector, ScrfdDetector};
pub use enroll::{EnrollConfig, EnrollError, ProfileHandle, ReferenceProfile};
pub use fusion::{Assessment, FusionEngine, Signals, StructuralSimilarity, Verdict, WindowedSsim};
pub use recognizer::{ArcFaceEmbedder, EmbeddingProvider, RecognizerError};
pub use report::{AnalysisReport, MatchRecord, StopReason};
pub use scan::{CancelFlag, Frame, FrameError, FrameSource, ScanConfig, ScanError};
pub use sinks::{ArtifactKind, ArtifactSink, ObservabilitySink, ProgressEvent, TracingObserver};
pub use types::{BoundingBox, Embedding};
