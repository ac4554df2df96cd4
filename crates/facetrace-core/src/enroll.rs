//! Reference enrollment: from one image to an immutable [`ReferenceProfile`].

use crate::descriptor::{self, Degenerate, Descriptor, CANONICAL_SIZE};
use crate::detector::{DetectParams, FaceDetector};
use crate::imaging;
use crate::recognizer::EmbeddingProvider;
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Shared handle to an enrolled profile. Scans hold their own clone, so
/// replacing the active profile never affects a scan already running.
pub type ProfileHandle = Arc<ReferenceProfile>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("could not read reference image: {0}")]
    ImageUnreadable(String),
    #[error("no clear face detected in reference image")]
    NoFaceDetected,
    #[error("face in reference image is too small ({face_width}px wide in a {image_width}px image)")]
    FaceTooSmall { face_width: u32, image_width: u32 },
    #[error("could not extract valid features from reference: {0}")]
    InvalidFeatures(#[from] Degenerate),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollConfig {
    /// Minimum face width and height passed to the detector.
    pub min_face_size: u32,
    /// Smallest accepted face width as a fraction of the image width.
    pub min_width_fraction: f32,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            min_face_size: 90,
            min_width_fraction: 0.12,
        }
    }
}

/// The enrolled identity: its crop, canonical forms, descriptor and,
/// when available, embedding.
#[derive(Debug, Clone)]
pub struct ReferenceProfile {
    crop: GrayImage,
    standard: GrayImage,
    descriptor: Descriptor,
    embedding: Option<Embedding>,
    source_box: BoundingBox,
}

impl ReferenceProfile {
    /// Build a profile from an already selected face crop.
    ///
    /// Embedding failure is not an error; the profile simply has none.
    pub fn from_crop(
        crop: GrayImage,
        source_box: BoundingBox,
        embedder: Option<&dyn EmbeddingProvider>,
    ) -> Result<Self, EnrollError> {
        let descriptor = descriptor::extract(&crop)?;
        let standard = imaging::resize_bilinear(&crop, CANONICAL_SIZE, CANONICAL_SIZE);

        let embedding = embedder.and_then(|e| e.embed(&crop));
        if embedder.is_some() && embedding.is_none() {
            tracing::warn!("reference embedding unavailable; scoring will use classical signals only");
        }

        Ok(Self {
            crop,
            standard,
            descriptor,
            embedding,
            source_box,
        })
    }

    /// Raw grayscale reference crop.
    pub fn crop(&self) -> &GrayImage {
        &self.crop
    }

    /// Crop resized to 100×100 without further processing.
    pub fn standard(&self) -> &GrayImage {
        &self.standard
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }

    /// Where the face was found in the reference image.
    pub fn source_box(&self) -> BoundingBox {
        self.source_box
    }
}

/// Decode image bytes and enroll the face they contain.
pub fn enroll(
    image_bytes: &[u8],
    detector: &dyn FaceDetector,
    embedder: Option<&dyn EmbeddingProvider>,
    config: &EnrollConfig,
) -> Result<ReferenceProfile, EnrollError> {
    let image = image::load_from_memory(image_bytes)
        .map_err(|e| EnrollError::ImageUnreadable(e.to_string()))?
        .to_luma8();
    enroll_image(&image, detector, embedder, config)
}

/// Enroll from an already decoded grayscale image.
pub fn enroll_image(
    image: &GrayImage,
    detector: &dyn FaceDetector,
    embedder: Option<&dyn EmbeddingProvider>,
    config: &EnrollConfig,
) -> Result<ReferenceProfile, EnrollError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(EnrollError::ImageUnreadable("image has no pixels".into()));
    }

    let params = DetectParams::strict(config.min_face_size);
    let faces = match detector.detect(image, &params) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!(error = %e, "reference detection failed");
            return Err(EnrollError::NoFaceDetected);
        }
    };

    let face = select_reference_face(&faces, image.width()).ok_or(EnrollError::NoFaceDetected)?;
    tracing::debug!(candidates = faces.len(), ?face, "reference face selected");

    if (face.width as f32) < config.min_width_fraction * image.width() as f32 {
        return Err(EnrollError::FaceTooSmall {
            face_width: face.width,
            image_width: image.width(),
        });
    }

    let crop = imaging::crop(image, &face).ok_or(EnrollError::InvalidFeatures(Degenerate::EmptyCrop))?;
    let profile = ReferenceProfile::from_crop(crop, face, embedder)?;

    tracing::info!(
        width = face.width,
        height = face.height,
        embedding = profile.embedding.is_some(),
        "reference face enrolled"
    );
    Ok(profile)
}

/// Pick the largest face, breaking ties toward the horizontal center.
pub fn select_reference_face(faces: &[BoundingBox], image_width: u32) -> Option<BoundingBox> {
    let mid = image_width as f32 / 2.0;
    let offset = |b: &BoundingBox| (b.center_x() - mid).abs();

    faces.iter().copied().filter(|b| !b.is_empty()).max_by(|a, b| {
        a.area()
            .cmp(&b.area())
            .then_with(|| offset(b).partial_cmp(&offset(a)).unwrap_or(std::cmp::Ordering::Equal))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{face_patch, scene_with_face, FailingEmbedder, FixedDetector, PixelEmbedder};
    use image::Luma;
    use std::io::Cursor;

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_select_prefers_largest() {
        let faces = [BoundingBox::new(0, 0, 100, 100), BoundingBox::new(300, 0, 120, 120)];
        assert_eq!(select_reference_face(&faces, 640), Some(faces[1]));
    }

    #[test]
    fn test_select_tie_prefers_centered() {
        let faces = [
            BoundingBox::new(0, 0, 100, 100),
            BoundingBox::new(270, 0, 100, 100),
            BoundingBox::new(500, 0, 100, 100),
        ];
        assert_eq!(select_reference_face(&faces, 640), Some(faces[1]));
    }

    #[test]
    fn test_select_empty() {
        assert_eq!(select_reference_face(&[], 640), None);
    }

    #[test]
    fn test_enroll_from_bytes() {
        let face = BoundingBox::new(145, 95, 110, 110);
        let scene = scene_with_face(&face_patch(1, 110, 110), face, 400, 300);
        let detector = FixedDetector::always(vec![face]);

        let profile = enroll(&png_bytes(&scene), &detector, None, &EnrollConfig::default()).unwrap();
        assert_eq!(profile.source_box(), face);
        assert_eq!(profile.crop().dimensions(), (110, 110));
        assert_eq!(profile.standard().dimensions(), (CANONICAL_SIZE, CANONICAL_SIZE));
        assert!(profile.embedding().is_none());
        assert_eq!(detector.last_params().map(|p| p.min_neighbors), Some(8));
    }

    #[test]
    fn test_enroll_unreadable() {
        let detector = FixedDetector::always(vec![]);
        let err = enroll(b"definitely not an image", &detector, None, &EnrollConfig::default());
        assert!(matches!(err, Err(EnrollError::ImageUnreadable(_))));
    }

    #[test]
    fn test_enroll_no_face() {
        let scene = face_patch(2, 400, 300);
        let detector = FixedDetector::always(vec![]);
        assert_eq!(
            enroll_image(&scene, &detector, None, &EnrollConfig::default()).err(),
            Some(EnrollError::NoFaceDetected)
        );
    }

    #[test]
    fn test_enroll_detector_failure_is_no_face() {
        let scene = face_patch(3, 400, 300);
        let detector = FixedDetector::failing();
        assert_eq!(
            enroll_image(&scene, &detector, None, &EnrollConfig::default()).err(),
            Some(EnrollError::NoFaceDetected)
        );
    }

    #[test]
    fn test_enroll_face_too_small() {
        // 40px of 400px = 10% < 12%
        let scene = face_patch(4, 400, 300);
        let detector = FixedDetector::always(vec![BoundingBox::new(10, 10, 40, 40)]);
        assert_eq!(
            enroll_image(&scene, &detector, None, &EnrollConfig::default()).err(),
            Some(EnrollError::FaceTooSmall { face_width: 40, image_width: 400 })
        );
    }

    #[test]
    fn test_enroll_flat_face_invalid_features() {
        let scene = GrayImage::from_pixel(400, 300, Luma([120]));
        let detector = FixedDetector::always(vec![BoundingBox::new(100, 100, 100, 100)]);
        assert_eq!(
            enroll_image(&scene, &detector, None, &EnrollConfig::default()).err(),
            Some(EnrollError::InvalidFeatures(Degenerate::FlatCrop))
        );
    }

    #[test]
    fn test_enroll_with_embedding() {
        let face = BoundingBox::new(145, 95, 110, 110);
        let scene = scene_with_face(&face_patch(5, 110, 110), face, 400, 300);
        let detector = FixedDetector::always(vec![face]);
        let profile =
            enroll_image(&scene, &detector, Some(&PixelEmbedder), &EnrollConfig::default()).unwrap();
        let embedding = profile.embedding().unwrap();
        let norm = embedding.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_enroll_embedding_failure_is_not_fatal() {
        let face = BoundingBox::new(145, 95, 110, 110);
        let scene = scene_with_face(&face_patch(6, 110, 110), face, 400, 300);
        let detector = FixedDetector::always(vec![face]);
        let profile =
            enroll_image(&scene, &detector, Some(&FailingEmbedder), &EnrollConfig::default()).unwrap();
        assert!(profile.embedding().is_none());
    }
}
