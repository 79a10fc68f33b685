//! ONNX Runtime backend for the embedding path.
//!
//! Expects a single-input graph exported from torchvision's MobileNetV2
//! (IMAGENET1K_V1 weights) with the classifier removed and the model in eval
//! mode, so batch-norm statistics are frozen and dropout is absent.

use super::embedding::{pool_output, Embedding, EmbeddingError, FeatureExtractor};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

/// `Session::run` takes `&mut self`, so calls are serialized behind a mutex
/// while the handle itself is shared as `&self`.
pub struct OnnxExtractor {
    session: Mutex<Session>,
    name: String,
    dimension: usize,
}

impl OnnxExtractor {
    /// Load the graph at `model_path`. Any failure here leaves the embedding
    /// path unavailable; there is no fallback weight source.
    pub fn load(
        model_path: &Path,
        dimension: usize,
        intra_threads: usize,
    ) -> Result<Self, EmbeddingError> {
        if !model_path.exists() {
            return Err(EmbeddingError::ModelLoad(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| EmbeddingError::ModelLoad(e.to_string()))?
            .with_intra_threads(intra_threads)
            .map_err(|e: ort::Error| EmbeddingError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e: ort::Error| EmbeddingError::ModelLoad(format!("ONNX load failed: {e}")))?;

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        log::info!("Feature extractor loaded from {}", model_path.display());

        Ok(Self {
            session: Mutex::new(session),
            name,
            dimension,
        })
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&self, input: &Array4<f32>) -> Result<Embedding, EmbeddingError> {
        let tensor = TensorRef::from_array_view(input)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbeddingError::Inference("session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| EmbeddingError::Inference(format!("ONNX inference failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::Inference(format!("output extraction: {e}")))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let values = pool_output(&dims, data)?;

        if values.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                left: values.len(),
                right: self.dimension,
            });
        }

        Ok(Embedding::new(values))
    }
}
