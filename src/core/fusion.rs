use super::histogram::histogram_correlation;
use super::image::ClassicalImage;
use super::orb::{keypoint_score, OrbConfig};
use super::ssim::{ssim_score, SignalError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_THRESHOLD: f64 = 0.85;
pub const DEFAULT_WORKING_SIZE: u32 = 256;

/// Parameters of the classical path that are not part of the decision rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassicalConfig {
    /// Both images are resized to this square before any signal runs.
    pub working_size: u32,
    pub orb: OrbConfig,
}

impl Default for ClassicalConfig {
    fn default() -> Self {
        Self {
            working_size: DEFAULT_WORKING_SIZE,
            orb: OrbConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub histogram: f64,
    pub structural: f64,
    pub keypoints: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            histogram: 1.0 / 3.0,
            structural: 1.0 / 3.0,
            keypoints: 1.0 / 3.0,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f64 {
        self.histogram + self.structural + self.keypoints
    }

    pub fn is_valid(&self) -> bool {
        let all = [self.histogram, self.structural, self.keypoints];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && self.total() > 0.0
    }
}

/// Decision rule of the classical path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionPolicy {
    pub threshold: f64,
    pub weights: SignalWeights,
    /// Floor the histogram correlation at 0 before averaging. With `false`
    /// a negative correlation pulls the mean below the other two signals.
    pub clamp_histogram: bool,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            weights: SignalWeights::default(),
            clamp_histogram: true,
        }
    }
}

/// The three classical measurements for one image pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalTriple {
    pub histogram: f64,
    pub structural: f64,
    pub keypoints: f64,
    pub histogram_raw: f64,
    pub structural_raw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionOutcome {
    pub signals: SignalTriple,
    pub mean: f64,
    pub threshold: f64,
    pub matched: bool,
}

impl FusionOutcome {
    /// 1 for a match, 0 otherwise.
    pub fn verdict(&self) -> u8 {
        u8::from(self.matched)
    }
}

/// Run the three signal extractors in parallel. The images must share
/// dimensions (the classical profile guarantees it).
pub fn compute_signals(
    a: &ClassicalImage,
    b: &ClassicalImage,
    config: &ClassicalConfig,
) -> Result<SignalTriple, SignalError> {
    let (histogram, (structural, keypoints)) = rayon::join(
        || histogram_correlation(&a.color, &b.color),
        || {
            rayon::join(
                || ssim_score(&a.gray, &b.gray),
                || keypoint_score(&a.gray, &b.gray, &config.orb),
            )
        },
    );
    let structural = structural?;

    Ok(SignalTriple {
        histogram: histogram.score,
        structural: structural.score,
        keypoints,
        histogram_raw: histogram.raw,
        structural_raw: structural.raw,
    })
}

impl FusionPolicy {
    pub fn with_threshold(self, threshold: f64) -> Self {
        Self { threshold, ..self }
    }

    pub fn weighted_mean(&self, signals: &SignalTriple) -> f64 {
        let histogram = if self.clamp_histogram {
            signals.histogram
        } else {
            signals.histogram_raw
        };
        let w = &self.weights;
        (w.histogram * histogram + w.structural * signals.structural + w.keypoints * signals.keypoints)
            / w.total()
    }

    /// Match iff the weighted mean reaches the threshold.
    pub fn decide(&self, signals: &SignalTriple) -> FusionOutcome {
        let mean = self.weighted_mean(signals);
        FusionOutcome {
            signals: *signals,
            mean,
            threshold: self.threshold,
            matched: mean >= self.threshold,
        }
    }
}
