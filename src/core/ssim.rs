use image::GrayImage;
use thiserror::Error;

const WINDOW: usize = 7;
const DATA_RANGE: f64 = 255.0;
const K1: f64 = 0.01;
const K2: f64 = 0.03;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("image dimensions differ: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },

    #[error("image {width}x{height} is smaller than the {window}x{window} window")]
    TooSmall { width: u32, height: u32, window: usize },
}

/// Summed-area table with one row and column of zero padding.
struct Integral {
    stride: usize,
    values: Vec<f64>,
}

impl Integral {
    fn build(width: usize, height: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut values = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += f(x, y);
                values[(y + 1) * stride + x + 1] = values[y * stride + x + 1] + row;
            }
        }
        Self { stride, values }
    }

    /// Sum over the `WINDOW x WINDOW` block whose top-left corner is `(x, y)`.
    fn window(&self, x: usize, y: usize) -> f64 {
        let (x1, y1) = (x + WINDOW, y + WINDOW);
        self.values[y1 * self.stride + x1] - self.values[y * self.stride + x1]
            - self.values[y1 * self.stride + x]
            + self.values[y * self.stride + x]
    }
}

/// Mean structural similarity index over all 7x7 windows lying fully inside
/// the image. Uses sample (co)variances and the standard `C1`/`C2`
/// stabilizers for 8-bit data. Range is [-1, 1].
pub fn structural_similarity(a: &GrayImage, b: &GrayImage) -> Result<f64, SignalError> {
    if a.dimensions() != b.dimensions() {
        return Err(SignalError::DimensionMismatch {
            left: a.dimensions(),
            right: b.dimensions(),
        });
    }
    let (width, height) = a.dimensions();
    if (width as usize) < WINDOW || (height as usize) < WINDOW {
        return Err(SignalError::TooSmall {
            width,
            height,
            window: WINDOW,
        });
    }

    let (w, h) = (width as usize, height as usize);
    let (pa, pb) = (a.as_raw(), b.as_raw());
    let px = |buf: &[u8], x: usize, y: usize| buf[y * w + x] as f64;

    let sum_a = Integral::build(w, h, |x, y| px(pa, x, y));
    let sum_b = Integral::build(w, h, |x, y| px(pb, x, y));
    let sum_aa = Integral::build(w, h, |x, y| px(pa, x, y).powi(2));
    let sum_bb = Integral::build(w, h, |x, y| px(pb, x, y).powi(2));
    let sum_ab = Integral::build(w, h, |x, y| px(pa, x, y) * px(pb, x, y));

    let n = (WINDOW * WINDOW) as f64;
    let cov_norm = n / (n - 1.0);
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    let mut total = 0.0;
    let mut count = 0usize;
    for y in 0..=h - WINDOW {
        for x in 0..=w - WINDOW {
            let mu_a = sum_a.window(x, y) / n;
            let mu_b = sum_b.window(x, y) / n;
            let var_a = cov_norm * (sum_aa.window(x, y) / n - mu_a * mu_a);
            let var_b = cov_norm * (sum_bb.window(x, y) / n - mu_b * mu_b);
            let cov = cov_norm * (sum_ab.window(x, y) / n - mu_a * mu_b);

            let numerator = (2.0 * mu_a * mu_b + c1) * (2.0 * cov + c2);
            let denominator = (mu_a * mu_a + mu_b * mu_b + c1) * (var_a + var_b + c2);
            total += numerator / denominator;
            count += 1;
        }
    }

    Ok(total / count as f64)
}

/// Structural similarity for fusion: `raw` in [-1, 1], `score` floored at 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsimScore {
    pub raw: f64,
    pub score: f64,
}

pub fn ssim_score(a: &GrayImage, b: &GrayImage) -> Result<SsimScore, SignalError> {
    let raw = structural_similarity(a, b)?;
    Ok(SsimScore {
        raw,
        score: raw.clamp(0.0, 1.0),
    })
}
