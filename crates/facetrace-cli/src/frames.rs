use facetrace_core::{Frame, FrameError, FrameSource};
use std::path::{Path, PathBuf};

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Frames extracted from a video into a directory, one image per frame.
///
/// Files are ordered by name, so zero-padded names (`000123.png`) give the
/// video's frame order. The frame index is the position in that order.
pub struct DirectoryFrames {
    paths: Result<Vec<PathBuf>, String>,
    next: usize,
    fps: Option<f64>,
}

impl DirectoryFrames {
    /// List `dir`. A listing failure is reported by the first `next_frame`.
    pub fn open(dir: &Path, fps: Option<f64>) -> Self {
        let paths = list_frames(dir).map_err(|e| format!("{}: {e}", dir.display()));
        match &paths {
            Ok(p) => tracing::info!(dir = %dir.display(), frames = p.len(), "frame directory opened"),
            Err(e) => tracing::warn!(error = %e, "frame directory unreadable"),
        }
        Self { paths, next: 0, fps }
    }
}

fn list_frames(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_frame_extension(p))
        .collect();
    paths.sort();
    Ok(paths)
}

fn has_frame_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| FRAME_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

impl FrameSource for DirectoryFrames {
    /// 0 when unknown; the scanner then falls back to its default rate.
    fn fps(&self) -> f64 {
        self.fps.unwrap_or(0.0)
    }

    fn frame_count(&self) -> Option<u64> {
        self.paths.as_ref().ok().map(|p| p.len() as u64)
    }

    fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        let paths = match &self.paths {
            Ok(paths) => paths,
            Err(reason) => {
                let reason = reason.clone();
                self.paths = Ok(Vec::new());
                return Some(Err(FrameError::Source(reason)));
            }
        };

        let index = self.next;
        let path = paths.get(index)?;
        self.next += 1;

        let frame = match image::open(path) {
            Ok(img) => Ok(Frame { index: index as u64, image: img.to_luma8() }),
            Err(e) => Err(FrameError::Decode { index: index as u64, reason: format!("{}: {e}", path.display()) }),
        };
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("facetrace-frames-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_frames_in_name_order() {
        let dir = temp_dir("order");
        for (name, shade) in [("000002.png", 20u8), ("000000.png", 0), ("000001.png", 10)] {
            GrayImage::from_pixel(4, 3, Luma([shade])).save(dir.join(name)).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();

        let mut source = DirectoryFrames::open(&dir, Some(30.0));
        assert_eq!(source.frame_count(), Some(3));
        assert_eq!(source.fps(), 30.0);

        let shades: Vec<(u64, u8)> = std::iter::from_fn(|| source.next_frame())
            .map(|f| f.unwrap())
            .map(|f| (f.index, f.image.get_pixel(0, 0).0[0]))
            .collect();
        assert_eq!(shades, vec![(0, 0), (1, 10), (2, 20)]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corrupt_frame_is_decode_error() {
        let dir = temp_dir("corrupt");
        std::fs::write(dir.join("000000.png"), b"garbage").unwrap();
        let mut source = DirectoryFrames::open(&dir, None);
        assert_eq!(source.fps(), 0.0);
        assert!(matches!(source.next_frame(), Some(Err(FrameError::Decode { index: 0, .. }))));
        assert!(source.next_frame().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_fails_once() {
        let mut source = DirectoryFrames::open(Path::new("/nonexistent/facetrace/frames"), None);
        assert_eq!(source.frame_count(), None);
        assert!(matches!(source.next_frame(), Some(Err(FrameError::Source(_)))));
        assert!(source.next_frame().is_none());
    }
}
