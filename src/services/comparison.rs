use crate::config::Settings;
use crate::core::embedding::FeatureExtractor;
use crate::core::fusion::{compute_signals, ClassicalConfig, FusionOutcome, FusionPolicy};
use crate::core::image::{decode, DecodedImage};
use crate::error::CompareError;
use std::sync::Arc;
use std::time::Instant;

/// Entry point for both comparison modes.
///
/// Holds the feature extractor handle, if one was loaded, and the classical
/// configuration. Every call is independent and stateless, so one service is
/// shared by all concurrent requests.
#[derive(Clone)]
pub struct ComparisonService {
    extractor: Option<Arc<dyn FeatureExtractor>>,
    classical: ClassicalConfig,
    fusion: FusionPolicy,
}

impl ComparisonService {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, settings: &Settings) -> Self {
        Self {
            extractor: Some(extractor),
            classical: settings.classical.clone(),
            fusion: settings.fusion,
        }
    }

    /// A service that only offers the classical path.
    pub fn classical_only(settings: &Settings) -> Self {
        Self {
            extractor: None,
            classical: settings.classical.clone(),
            fusion: settings.fusion,
        }
    }

    pub fn extractor_name(&self) -> Option<&str> {
        self.extractor.as_deref().map(|e| e.name())
    }

    pub fn embedding_available(&self) -> bool {
        self.extractor.is_some()
    }

    pub fn fusion_policy(&self) -> &FusionPolicy {
        &self.fusion
    }

    /// Cosine similarity of the two images' embeddings, in [0, 1].
    pub fn compare_embeddings(&self, image1: &[u8], image2: &[u8]) -> Result<f64, CompareError> {
        let extractor = self
            .extractor
            .as_deref()
            .ok_or(CompareError::EmbeddingUnavailable)?;
        let start = Instant::now();

        let (first, second) = decode_pair(image1, image2)?;
        let (tensor1, tensor2) = rayon::join(
            || first.to_embedding_tensor(),
            || second.to_embedding_tensor(),
        );

        let embedding1 = extractor.extract(&tensor1)?;
        let embedding2 = extractor.extract(&tensor2)?;
        let similarity = embedding1.cosine_similarity(&embedding2)?;

        log::debug!(
            "Embedding similarity {similarity:.4} ({}-d, {:.2?})",
            embedding1.dimension(),
            start.elapsed()
        );
        Ok(similarity)
    }

    /// Match decision at the configured threshold: 1 or 0.
    pub fn compare_binary(&self, image1: &[u8], image2: &[u8]) -> Result<u8, CompareError> {
        Ok(self.evaluate_binary(image1, image2, &self.fusion)?.verdict())
    }

    pub fn compare_binary_with_threshold(
        &self,
        image1: &[u8],
        image2: &[u8],
        threshold: f64,
    ) -> Result<u8, CompareError> {
        let policy = self.fusion.with_threshold(threshold);
        Ok(self.evaluate_binary(image1, image2, &policy)?.verdict())
    }

    /// Full classical evaluation: the three signals, their mean and the verdict.
    pub fn evaluate_binary(
        &self,
        image1: &[u8],
        image2: &[u8],
        policy: &FusionPolicy,
    ) -> Result<FusionOutcome, CompareError> {
        let start = Instant::now();
        let (first, second) = decode_pair(image1, image2)?;

        let size = self.classical.working_size;
        let (a, b) = rayon::join(|| first.to_classical(size), || second.to_classical(size));
        let signals = compute_signals(&a, &b, &self.classical)?;
        let outcome = policy.decide(&signals);

        log::debug!(
            "Signals hist={:.4} (raw {:.4}) ssim={:.4} orb={:.4} mean={:.4} threshold={} -> {} ({:.2?})",
            signals.histogram,
            signals.histogram_raw,
            signals.structural,
            signals.keypoints,
            outcome.mean,
            outcome.threshold,
            outcome.verdict(),
            start.elapsed()
        );
        Ok(outcome)
    }
}

fn decode_pair(image1: &[u8], image2: &[u8]) -> Result<(DecodedImage, DecodedImage), CompareError> {
    let (first, second) = rayon::join(|| decode(image1), || decode(image2));
    let first = first.map_err(|source| CompareError::Decode {
        image: "image1",
        source,
    })?;
    let second = second.map_err(|source| CompareError::Decode {
        image: "image2",
        source,
    })?;
    Ok((first, second))
}
