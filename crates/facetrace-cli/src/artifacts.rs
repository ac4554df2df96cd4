use facetrace_core::{imaging, ArtifactSink, BoundingBox, Frame};
use image::{GrayImage, Luma};
use std::path::{Path, PathBuf};

/// Writes `{label}_crop.png` and an annotated `{label}_frame.png` per candidate.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn save(&self, image: &GrayImage, name: &str) {
        let path = self.dir.join(name);
        if let Err(e) = image.save(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write artifact");
        }
    }
}

impl ArtifactSink for DirectorySink {
    fn record(&self, frame: &Frame, bbox: &BoundingBox, label: &str) {
        if let Some(crop) = imaging::crop(&frame.image, bbox) {
            self.save(&crop, &format!("{label}_crop.png"));
        }
        let mut annotated = frame.image.clone();
        draw_outline(&mut annotated, bbox);
        self.save(&annotated, &format!("{label}_frame.png"));
        tracing::debug!(label, frame = frame.index, "artifact written");
    }
}

/// Two-pixel white rectangle along the inside of `bbox`.
fn draw_outline(image: &mut GrayImage, bbox: &BoundingBox) {
    let b = bbox.clipped(image.width(), image.height());
    if b.is_empty() {
        return;
    }
    let (right, bottom) = (b.x + b.width - 1, b.y + b.height - 1);
    for t in 0..2 {
        for x in b.x..=right {
            image.put_pixel(x, (b.y + t).min(bottom), Luma([255]));
            image.put_pixel(x, bottom.saturating_sub(t).max(b.y), Luma([255]));
        }
        for y in b.y..=bottom {
            image.put_pixel((b.x + t).min(right), y, Luma([255]));
            image.put_pixel(right.saturating_sub(t).max(b.x), y, Luma([255]));
        }
    }
}
