//! Multi-signal similarity fusion and the match decision.
//!
//! A candidate crop is compared to the reference profile through up to four
//! independent signals:
//!
//! | signal                 | range    |
//! |------------------------|----------|
//! | feature-cosine         | 0 – 30   |
//! | template-correlation   | 0 – 25   |
//! | structural-similarity  | 0 – 20   |
//! | embedding-cosine       | 0 – 100  |
//!
//! [`fuse`] combines them into one confidence in [0, 100]. Scoring performs
//! no I/O and keeps no state between calls.

use crate::descriptor::{self, Degenerate, CANONICAL_SIZE};
use crate::enroll::ReferenceProfile;
use crate::imaging;
use crate::recognizer::EmbeddingProvider;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const FEATURE_WEIGHT: f32 = 30.0;
pub const TEMPLATE_WEIGHT: f32 = 25.0;
pub const STRUCTURAL_WEIGHT: f32 = 20.0;
pub const EMBEDDING_WEIGHT: f32 = 100.0;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 85.0;

const EMBEDDING_SHARE: f32 = 0.85;
const CLASSICAL_SHARE: f32 = 0.15;

const WEAK_TEMPLATE: f32 = 10.0;
const WEAK_TEMPLATE_PENALTY: f32 = 0.85;

const STRONG_TEMPLATE: f32 = 12.0;
const STRONG_STRUCTURAL: f32 = 10.0;
const STRONG_EMBEDDING: f32 = 70.0;
const UNSUPPORTED_PENALTY: f32 = 0.75;

const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const SSIM_DATA_RANGE: f64 = 255.0;
const SSIM_WINDOW: u32 = 7;

/// Why a single signal could not be measured. Always recovered by scoring.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("{0} image has no intensity variance")]
    FlatImage(&'static str),
    #[error("image sizes differ: {0:?} vs {1:?}")]
    DimensionMismatch((u32, u32), (u32, u32)),
    #[error("image smaller than the {0}x{0} window")]
    TooSmall(u32),
    #[error("no structural similarity metric configured")]
    NotConfigured,
    #[error("reference has no embedding")]
    NoReferenceEmbedding,
    #[error("no embedding provider configured")]
    NoEmbeddingProvider,
    #[error("embedding provider returned nothing for the candidate")]
    CandidateEmbeddingFailed,
    #[error("non-finite similarity")]
    NonFinite,
}

/// Weighted signal values for one comparison. Failed signals are 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    pub feature: f32,
    pub template: f32,
    pub structural: f32,
    pub embedding: f32,
}

impl Signals {
    /// Map a raw similarity in [-1, 1] to a weighted contribution.
    ///
    /// Negative correlation is discarded, and this is the only place where a
    /// failed signal becomes a zero contribution.
    pub fn contribution(name: &'static str, similarity: Result<f32, SignalError>, weight: f32) -> f32 {
        match similarity.and_then(|s| if s.is_finite() { Ok(s) } else { Err(SignalError::NonFinite) }) {
            Ok(s) => s.clamp(0.0, 1.0) * weight,
            Err(e) => {
                tracing::debug!(signal = name, reason = %e, "signal unavailable, contributes 0");
                0.0
            }
        }
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Match,
    NoMatch,
}

impl Verdict {
    pub fn from_confidence(confidence: f32, threshold: f32) -> Self {
        if confidence >= threshold {
            Verdict::Match
        } else {
            Verdict::NoMatch
        }
    }

    pub fn is_match(self) -> bool {
        self == Verdict::Match
    }
}

/// Outcome of scoring one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub signals: Signals,
    /// Fused confidence in [0, 100].
    pub confidence: f32,
    pub verdict: Verdict,
}

impl Assessment {
    fn rejected() -> Self {
        Self {
            signals: Signals::default(),
            confidence: 0.0,
            verdict: Verdict::NoMatch,
        }
    }
}

/// Combine weighted signals into a confidence in [0, 100].
///
/// Rules apply in order:
/// 1. with an embedding: `0.85·embedding + 0.15·(template + structural)`,
///    otherwise `feature + template + structural` (at most 75);
/// 2. weak template (< 10) without an embedding: × 0.85;
/// 3. no strong signal (template ≥ 12, structural ≥ 10 or embedding ≥ 70): × 0.75;
/// 4. clamp.
pub fn fuse(signals: &Signals) -> f32 {
    let Signals { feature, template, structural, embedding } = *signals;

    let mut total = if embedding > 0.0 {
        EMBEDDING_SHARE * embedding + CLASSICAL_SHARE * (template + structural)
    } else {
        feature + template + structural
    };

    if template < WEAK_TEMPLATE && embedding == 0.0 {
        total *= WEAK_TEMPLATE_PENALTY;
    }

    let supported = template >= STRONG_TEMPLATE
        || structural >= STRONG_STRUCTURAL
        || embedding >= STRONG_EMBEDDING;
    if !supported {
        total *= UNSUPPORTED_PENALTY;
    }

    if total.is_nan() {
        return 0.0;
    }
    total.clamp(0.0, 100.0)
}

/// Zero-mean normalized cross-correlation of two equally sized images.
pub fn normalized_cross_correlation(a: &GrayImage, b: &GrayImage) -> Result<f32, SignalError> {
    if a.dimensions() != b.dimensions() {
        return Err(SignalError::DimensionMismatch(a.dimensions(), b.dimensions()));
    }
    let (mean_a, _) = imaging::mean_and_std(a);
    let (mean_b, _) = imaging::mean_and_std(b);

    let (mut cross, mut var_a, mut var_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&pa, &pb) in a.as_raw().iter().zip(b.as_raw()) {
        let da = pa as f64 - mean_a as f64;
        let db = pb as f64 - mean_b as f64;
        cross += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a <= 1e-9 {
        return Err(SignalError::FlatImage("candidate"));
    }
    if var_b <= 1e-9 {
        return Err(SignalError::FlatImage("reference"));
    }
    Ok((cross / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// A structural similarity index between two equally sized images, in [-1, 1].
pub trait StructuralSimilarity: Send + Sync {
    fn compare(&self, a: &GrayImage, b: &GrayImage) -> Result<f32, SignalError>;
}

/// Mean SSIM over every fully contained square window.
///
/// Uniform window, sample covariance, `K1 = 0.01`, `K2 = 0.03`, `L = 255`.
#[derive(Debug, Clone, Copy)]
pub struct WindowedSsim {
    pub window: u32,
}

impl Default for WindowedSsim {
    fn default() -> Self {
        Self { window: SSIM_WINDOW }
    }
}

impl StructuralSimilarity for WindowedSsim {
    fn compare(&self, a: &GrayImage, b: &GrayImage) -> Result<f32, SignalError> {
        if a.dimensions() != b.dimensions() {
            return Err(SignalError::DimensionMismatch(a.dimensions(), b.dimensions()));
        }
        let (w, h) = (a.width() as usize, a.height() as usize);
        let win = self.window.max(2) as usize;
        if w < win || h < win {
            return Err(SignalError::TooSmall(win as u32));
        }

        let c1 = (SSIM_K1 * SSIM_DATA_RANGE).powi(2);
        let c2 = (SSIM_K2 * SSIM_DATA_RANGE).powi(2);
        let n = (win * win) as f64;
        let cov_norm = n / (n - 1.0);
        let (da, db) = (a.as_raw(), b.as_raw());

        let mut total = 0.0f64;
        let mut windows = 0usize;
        for top in 0..=(h - win) {
            for left in 0..=(w - win) {
                let (mut sa, mut sb, mut saa, mut sbb, mut sab) = (0.0, 0.0, 0.0, 0.0, 0.0);
                for y in top..top + win {
                    let row = y * w;
                    for x in left..left + win {
                        let pa = da[row + x] as f64;
                        let pb = db[row + x] as f64;
                        sa += pa;
                        sb += pb;
                        saa += pa * pa;
                        sbb += pb * pb;
                        sab += pa * pb;
                    }
                }
                let (ux, uy) = (sa / n, sb / n);
                let vx = cov_norm * (saa / n - ux * ux);
                let vy = cov_norm * (sbb / n - uy * uy);
                let vxy = cov_norm * (sab / n - ux * uy);

                total += ((2.0 * ux * uy + c1) * (2.0 * vxy + c2))
                    / ((ux * ux + uy * uy + c1) * (vx + vy + c2));
                windows += 1;
            }
        }

        Ok((total / windows as f64) as f32)
    }
}

/// Scores candidates against a reference profile.
///
/// Optional capabilities (structural metric, embedding provider) are fixed at
/// construction; an absent capability makes its signal contribute 0.
pub struct FusionEngine {
    threshold: f32,
    structural: Option<Box<dyn StructuralSimilarity>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl FusionEngine {
    /// Engine with the built-in SSIM and no embedding provider.
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            structural: Some(Box::new(WindowedSsim::default())),
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_structural(mut self, structural: Option<Box<dyn StructuralSimilarity>>) -> Self {
        self.structural = structural;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn embedder(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.embedder.as_ref()
    }

    /// Score one candidate crop.
    ///
    /// Degenerate candidates are never matched: confidence 0, `NoMatch`.
    pub fn score(&self, profile: &ReferenceProfile, candidate: &GrayImage) -> Assessment {
        let signals = match self.signals(profile, candidate) {
            Ok(signals) => signals,
            Err(reason) => {
                tracing::debug!(%reason, "candidate rejected before scoring");
                return Assessment::rejected();
            }
        };

        let confidence = fuse(&signals);
        let verdict = Verdict::from_confidence(confidence, self.threshold);

        tracing::debug!(
            embedding = signals.embedding,
            feature = signals.feature,
            template = signals.template,
            structural = signals.structural,
            confidence,
            ?verdict,
            "candidate scored"
        );

        Assessment { signals, confidence, verdict }
    }

    /// Measure every signal for a candidate.
    pub fn signals(&self, profile: &ReferenceProfile, candidate: &GrayImage) -> Result<Signals, Degenerate> {
        let descriptor = descriptor::extract(candidate)?;

        let feature = Ok(profile.descriptor().similarity(&descriptor));

        let reference = profile.crop();
        let resized = imaging::resize_bilinear(candidate, reference.width(), reference.height());
        let template = normalized_cross_correlation(&resized, reference);

        let structural = match &self.structural {
            Some(metric) => {
                let standard = imaging::resize_bilinear(candidate, CANONICAL_SIZE, CANONICAL_SIZE);
                metric.compare(profile.standard(), &standard)
            }
            None => Err(SignalError::NotConfigured),
        };

        let embedding = self.embedding_similarity(profile, candidate);

        Ok(Signals {
            feature: Signals::contribution("feature-cosine", feature, FEATURE_WEIGHT),
            template: Signals::contribution("template-correlation", template, TEMPLATE_WEIGHT),
            structural: Signals::contribution("structural-similarity", structural, STRUCTURAL_WEIGHT),
            embedding: Signals::contribution("embedding-cosine", embedding, EMBEDDING_WEIGHT),
        })
    }

    fn embedding_similarity(&self, profile: &ReferenceProfile, candidate: &GrayImage) -> Result<f32, SignalError> {
        let reference = profile.embedding().ok_or(SignalError::NoReferenceEmbedding)?;
        let provider = self.embedder.as_ref().ok_or(SignalError::NoEmbeddingProvider)?;
        let probe = provider.embed(candidate).ok_or(SignalError::CandidateEmbeddingFailed)?;
        Ok(reference.similarity(&probe))
    }
}
