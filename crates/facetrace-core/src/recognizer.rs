//! Deep face embeddings: the provider contract and an ArcFace backend.
//!
//! Providers return `None` when they cannot embed a crop. A missing embedding
//! only removes one signal from fusion, it never fails a comparison.

use crate::imaging;
use crate::types::Embedding;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0, ArcFace normalizes symmetrically
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("crop is empty")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces unit-norm embeddings for face crops.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, crop: &GrayImage) -> Option<Embedding>;
}

/// ArcFace-based embedding provider.
///
/// Crops are resized straight to 112×112; no landmark alignment is applied.
pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Run the model on one crop.
    pub fn extract(&self, crop: &GrayImage) -> Result<Embedding, RecognizerError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let size = ARCFACE_INPUT_SIZE as u32;
        let input = Self::preprocess(&imaging::resize_bilinear(crop, size, size));

        let raw: Vec<f32> = {
            let mut session = self.session.lock().map_err(|_| {
                RecognizerError::InferenceFailed("recognizer session poisoned".into())
            })?;
            let outputs =
                session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
                RecognizerError::InferenceFailed(format!("embedding extraction: {e}"))
            })?;
            data.to_vec()
        };

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Embedding::normalized(raw, Some(ARCFACE_MODEL_VERSION.to_string()))
            .ok_or_else(|| RecognizerError::InferenceFailed("zero-norm embedding".into()))
    }

    /// Turn a 112×112 grayscale crop into a NCHW float tensor.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));

        for (x, y, pixel) in face.enumerate_pixels() {
            let normalized = (pixel.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = normalized;
            }
        }

        tensor
    }
}

impl EmbeddingProvider for ArcFaceEmbedder {
    fn embed(&self, crop: &GrayImage) -> Option<Embedding> {
        match self.extract(crop) {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::debug!(error = %e, "ArcFace embedding unavailable for crop");
                None
            }
        }
    }
}
