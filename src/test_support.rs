//! Synthetic fixtures shared by the unit tests.

use crate::core::embedding::{Embedding, EmbeddingError, FeatureExtractor};
use image::{codecs::jpeg::JpegEncoder, ImageFormat, Rgb, RgbImage};
use ndarray::Array4;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::io::Cursor;

pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(color))
}

/// A corner-rich "photo": a vertical gradient covered with overlapping
/// rectangles of random colors.
pub fn synthetic_photo(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut rng = Pcg32::seed_from_u64(seed);
    let mut img = RgbImage::from_fn(width, height, |_, y| {
        let g = 40 + (160 * y / height.max(1)) as u8;
        Rgb([30, g, 180])
    });

    let margin = width.min(height) / 7;
    for _ in 0..60 {
        let w = rng.gen_range(12..40).min(width - 2 * margin);
        let h = rng.gen_range(12..40).min(height - 2 * margin);
        let x0 = rng.gen_range(margin..width - margin - w);
        let y0 = rng.gen_range(margin..height - margin - h);
        let color = Rgb([rng.gen_range(0..=255), rng.gen_range(0..=255), rng.gen_range(0..=255)]);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, color);
            }
        }
    }
    img
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn encode_jpeg(img: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, 90);
    img.write_with_encoder(encoder).unwrap();
    buf
}

/// Stand-in for the CNN: averages the standardized tensor over a coarse grid.
pub struct GridPoolExtractor {
    grid: usize,
}

impl GridPoolExtractor {
    pub fn new(grid: usize) -> Self {
        Self { grid }
    }
}

impl FeatureExtractor for GridPoolExtractor {
    fn name(&self) -> &str {
        "grid-pool-stub"
    }

    fn dimension(&self) -> usize {
        3 * self.grid * self.grid
    }

    fn extract(&self, input: &Array4<f32>) -> Result<Embedding, EmbeddingError> {
        let (_, channels, height, width) = input.dim();
        let cell_h = height / self.grid;
        let cell_w = width / self.grid;
        let mut values = Vec::with_capacity(self.dimension());
        for c in 0..channels {
            for gy in 0..self.grid {
                for gx in 0..self.grid {
                    let mut sum = 0.0f32;
                    for y in gy * cell_h..(gy + 1) * cell_h {
                        for x in gx * cell_w..(gx + 1) * cell_w {
                            sum += input[[0, c, y, x]];
                        }
                    }
                    values.push(sum / (cell_h * cell_w) as f32);
                }
            }
        }
        Ok(Embedding::new(values))
    }
}
