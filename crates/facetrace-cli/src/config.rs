use facetrace_core::fusion::DEFAULT_CONFIDENCE_THRESHOLD;
use facetrace_core::{EnrollConfig, ScanConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// CLI configuration: built-in defaults, then an optional TOML file, then
/// `FACETRACE_*` environment variables. Command-line flags are applied last
/// by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Fused confidence needed for a match, 0 to 100.
    pub confidence_threshold: f32,
    /// Load the ArcFace model and use embedding similarity.
    pub use_embedding: bool,
    /// Where match and borderline artifacts are written, if anywhere.
    pub debug_dir: Option<PathBuf>,
    pub enroll: EnrollConfig,
    pub scan: ScanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(&|key| std::env::var(key).ok()),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            use_embedding: true,
            debug_dir: None,
            enroll: EnrollConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `FACETRACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(&|key| std::env::var(key).ok());
        config
    }

    /// Read `path` as TOML, then apply the environment on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_toml_file(path)?;
        config.apply_env(&|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACETRACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("FACETRACE_DEBUG_DIR") {
            self.debug_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = var("FACETRACE_USE_EMBEDDING") {
            self.use_embedding = flag != "0";
        }
        if let Some(flag) = var("FACETRACE_SAVE_MATCHES") {
            self.scan.save_matches = flag != "0";
        }

        set_parsed(var, "FACETRACE_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        set_parsed(var, "FACETRACE_ENROLL_MIN_FACE_SIZE", &mut self.enroll.min_face_size);
        set_parsed(var, "FACETRACE_SAMPLE_INTERVAL", &mut self.scan.sample_interval);
        set_parsed(var, "FACETRACE_MIN_FACE_SIZE", &mut self.scan.min_face_size);
        set_parsed(var, "FACETRACE_BORDERLINE_CONFIDENCE", &mut self.scan.borderline_confidence);
        set_parsed(var, "FACETRACE_PROGRESS_EVERY", &mut self.scan.progress_every);
        if let Some(n) = parsed(var, "FACETRACE_MAX_FRAMES") {
            self.scan.max_frames = Some(n);
        }
        if let Some(s) = parsed(var, "FACETRACE_MAX_SECONDS") {
            self.scan.max_seconds = Some(s);
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

/// `$XDG_DATA_HOME/facetrace/models`, falling back to `~/.local/share`.
fn default_model_dir(var: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrace")
        .join("models")
}

fn parsed<T: FromStr>(var: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

fn set_parsed<T: FromStr>(var: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(value) = parsed(var, key) {
        *slot = value;
    }
}
