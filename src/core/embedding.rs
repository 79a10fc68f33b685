use ndarray::Array4;
use serde::Serialize;
use thiserror::Error;

/// Output width of MobileNetV2's pooled feature map.
pub const DEFAULT_EMBEDDING_DIM: usize = 1280;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to load feature extractor: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("embedding has zero or non-finite magnitude")]
    DegenerateVector,
}

/// Maps one standardized `[1, 3, H, W]` tensor to a feature vector.
///
/// Implementations are constructed once and shared read-only between
/// requests, so they must be `Send + Sync`. Runtimes that are not re-entrant
/// serialize internally.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn extract(&self, input: &Array4<f32>) -> Result<Embedding, EmbeddingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// `1 - cosine_distance`, clamped into [0, 1].
    ///
    /// Lengths must agree and neither vector may have zero magnitude; both
    /// cases are reported instead of producing NaN.
    pub fn cosine_similarity(&self, other: &Embedding) -> Result<f64, EmbeddingError> {
        if self.dimension() != other.dimension() {
            return Err(EmbeddingError::DimensionMismatch {
                left: self.dimension(),
                right: other.dimension(),
            });
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (&a, &b) in self.0.iter().zip(other.0.iter()) {
            let (a, b) = (a as f64, b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if !denom.is_finite() || denom == 0.0 || !dot.is_finite() {
            return Err(EmbeddingError::DegenerateVector);
        }

        let cosine_distance = 1.0 - dot / denom;
        Ok((1.0 - cosine_distance).clamp(0.0, 1.0))
    }
}

/// Collapse a network output to one value per channel.
///
/// Accepts `[1, C]`, `[1, C, 1, 1]` and `[1, C, H, W]`; spatial maps are
/// global-average-pooled.
pub fn pool_output(shape: &[usize], data: &[f32]) -> Result<Vec<f32>, EmbeddingError> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(EmbeddingError::Inference(format!(
            "output shape {shape:?} does not match {} values",
            data.len()
        )));
    }

    match shape {
        [1, channels] => Ok(data[..*channels].to_vec()),
        [1, channels, height, width] => {
            let plane = height * width;
            if plane == 0 {
                return Err(EmbeddingError::Inference("empty spatial map".to_string()));
            }
            Ok((0..*channels)
                .map(|c| data[c * plane..(c + 1) * plane].iter().sum::<f32>() / plane as f32)
                .collect())
        }
        _ => Err(EmbeddingError::Inference(format!(
            "unexpected output shape {shape:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_vectors_are_fully_similar() {
        let v = Embedding::new(vec![0.3, 1.2, 0.0, 4.5]);
        let similarity = v.cosine_similarity(&v).unwrap();
        assert!((similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let a = Embedding::new(vec![0.1, 0.7, 2.0]);
        let b = Embedding::new(vec![1.5, 0.2, 0.9]);
        assert_eq!(
            a.cosine_similarity(&b).unwrap(),
            b.cosine_similarity(&a).unwrap()
        );
    }

    #[test]
    fn test_magnitude_invariance() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![10.0, 20.0, 30.0]);
        assert!((a.cosine_similarity(&b).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_orthogonal_and_opposite_vectors() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.cosine_similarity(&b).unwrap().abs() < 1e-12);

        let c = Embedding::new(vec![-1.0, 0.0]);
        assert_eq!(a.cosine_similarity(&c).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_is_reported() {
        let a = Embedding::new(vec![1.0, 2.0]);
        let b = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            a.cosine_similarity(&b),
            Err(EmbeddingError::DimensionMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn test_zero_vector_is_degenerate() {
        let a = Embedding::new(vec![0.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            a.cosine_similarity(&b),
            Err(EmbeddingError::DegenerateVector)
        ));
        assert!(matches!(
            b.cosine_similarity(&a),
            Err(EmbeddingError::DegenerateVector)
        ));
    }

    #[test]
    fn test_pool_flat_output() {
        let pooled = pool_output(&[1, 3], &[0.5, 1.0, 1.5]).unwrap();
        assert_eq!(pooled, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_pool_spatial_output() {
        let data = [1.0, 3.0, 5.0, 7.0, 0.0, 0.0, 2.0, 2.0];
        let pooled = pool_output(&[1, 2, 2, 2], &data).unwrap();
        assert_eq!(pooled, vec![4.0, 1.0]);
    }

    #[test]
    fn test_pool_rejects_batched_output() {
        let data = vec![0.0; 8];
        assert!(pool_output(&[2, 4], &data).is_err());
        assert!(pool_output(&[1, 4], &data).is_err());
    }
}
