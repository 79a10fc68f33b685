use image::RgbImage;
use serde::Serialize;

/// Bins per channel of the joint color histogram.
pub const BINS_PER_CHANNEL: usize = 8;
const BIN_COUNT: usize = BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL;
const BIN_SHIFT: u32 = 8 - BINS_PER_CHANNEL.trailing_zeros();

/// Pearson correlation of two color histograms.
///
/// `raw` lies in [-1, 1]; strongly disjoint color distributions correlate
/// negatively. `score` is `raw` floored at 0 and capped at 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramScore {
    pub raw: f64,
    pub score: f64,
}

/// L2-normalized 8x8x8 joint RGB histogram.
pub fn color_histogram(img: &RgbImage) -> Vec<f64> {
    let mut bins = vec![0.0f64; BIN_COUNT];
    for pixel in img.pixels() {
        let [r, g, b] = pixel.0;
        let index = ((r >> BIN_SHIFT) as usize * BINS_PER_CHANNEL + (g >> BIN_SHIFT) as usize)
            * BINS_PER_CHANNEL
            + (b >> BIN_SHIFT) as usize;
        bins[index] += 1.0;
    }

    let norm = bins.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut bins {
            *v /= norm;
        }
    }
    bins
}

/// Pearson correlation. Flat inputs (zero variance) are treated as identical.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 1.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a[..n].iter().zip(&b[..n]) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        num += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom > f64::EPSILON {
        (num / denom).clamp(-1.0, 1.0)
    } else {
        1.0
    }
}

pub fn histogram_correlation(a: &RgbImage, b: &RgbImage) -> HistogramScore {
    let raw = correlation(&color_histogram(a), &color_histogram(b));
    if raw < 0.0 {
        log::debug!("Negative histogram correlation: {raw:.4}");
    }
    HistogramScore {
        raw,
        score: raw.clamp(0.0, 1.0),
    }
}
