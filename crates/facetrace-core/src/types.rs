use serde::{Deserialize, Serialize};

/// Pixel-aligned bounding box of a detected face.
///
/// Serialized as `[x, y, width, height]`, the shape report consumers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Horizontal center in pixels.
    pub fn center_x(&self) -> f32 {
        self.x as f32 + self.width as f32 / 2.0
    }

    /// Intersect with a `frame_width` × `frame_height` frame.
    pub fn clipped(&self, frame_width: u32, frame_height: u32) -> Self {
        let x0 = self.x.min(frame_width);
        let y0 = self.y.min(frame_height);
        let x1 = self.x.saturating_add(self.width).min(frame_width);
        let y1 = self.y.saturating_add(self.height).min(frame_height);
        Self {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// Grow the box on every side by `fraction` of its average dimension,
    /// then clip to the frame.
    ///
    /// The margin is `floor(fraction * (width + height) / 2)` pixels.
    pub fn padded(&self, fraction: f32, frame_width: u32, frame_height: u32) -> Self {
        let margin = (fraction.max(0.0) * (self.width as f32 + self.height as f32) / 2.0) as u32;
        let x0 = self.x.saturating_sub(margin);
        let y0 = self.y.saturating_sub(margin);
        let x1 = self.x.saturating_add(self.width).saturating_add(margin);
        let y1 = self.y.saturating_add(self.height).saturating_add(margin);
        Self {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
        .clipped(frame_width, frame_height)
    }
}

impl From<[u32; 4]> for BoundingBox {
    fn from([x, y, width, height]: [u32; 4]) -> Self {
        Self { x, y, width, height }
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// Cosine similarity in [-1, 1]. Zero-norm inputs yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-8 || !denom.is_finite() {
        return 0.0;
    }
    ((dot / denom) as f32).clamp(-1.0, 1.0)
}

/// Unit-norm face embedding produced by an [`EmbeddingProvider`](crate::EmbeddingProvider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// L2-normalize `raw` into an embedding.
    ///
    /// Returns `None` for vectors that cannot be normalized (empty, NaN, zero).
    pub fn normalized(raw: Vec<f32>, model_version: Option<String>) -> Option<Self> {
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= 1e-6 {
            return None;
        }
        Some(Self {
            values: raw.into_iter().map(|x| x / norm).collect(),
            model_version,
        })
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_grows_by_average_half_dimension() {
        // (100 + 100) / 2 * 0.05 = 5
        let b = BoundingBox::new(150, 100, 100, 100).padded(0.05, 400, 300);
        assert_eq!(b, BoundingBox::new(145, 95, 110, 110));
    }

    #[test]
    fn test_padded_clips_to_frame() {
        let b = BoundingBox::new(2, 3, 100, 60).padded(0.05, 104, 64);
        // margin = floor(0.05 * 80) = 4
        assert_eq!(b, BoundingBox::new(0, 0, 104, 64));
    }

    #[test]
    fn test_padded_margin_floors() {
        // 0.05 * (30 + 20) / 2 = 1.25 -> 1
        let b = BoundingBox::new(10, 10, 30, 20).padded(0.05, 100, 100);
        assert_eq!(b, BoundingBox::new(9, 9, 32, 22));
    }

    #[test]
    fn test_padded_huge_box_clips_without_overflow() {
        let b = BoundingBox::new(0, 0, u32::MAX, u32::MAX).padded(0.05, 640, 480);
        assert_eq!(b, BoundingBox::new(0, 0, 640, 480));
    }

    #[test]
    fn test_clipped_outside_frame_is_empty() {
        let b = BoundingBox::new(500, 10, 20, 20).clipped(400, 300);
        assert!(b.is_empty());
    }

    #[test]
    fn test_box_serializes_as_array() {
        let json = serde_json::to_string(&BoundingBox::new(1, 2, 3, 4)).unwrap();
        assert_eq!(json, "[1,2,3,4]");
        let back: BoundingBox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BoundingBox::new(1, 2, 3, 4));
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_embedding_normalized_is_unit() {
        let e = Embedding::normalized(vec![3.0, 4.0], None).unwrap();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(e.dim(), 2);
    }

    #[test]
    fn test_embedding_normalized_rejects_zero_and_nan() {
        assert!(Embedding::normalized(vec![0.0; 4], None).is_none());
        assert!(Embedding::normalized(vec![f32::NAN, 1.0], None).is_none());
        assert!(Embedding::normalized(Vec::new(), None).is_none());
    }
}
