//! Oriented FAST keypoints with rotated BRIEF descriptors, matched by
//! brute-force Hamming distance with a cross-check.

use image::{imageops, imageops::FilterType, GrayImage};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const DESCRIPTOR_BITS: usize = 256;
const DESCRIPTOR_WORDS: usize = DESCRIPTOR_BITS / 64;
const PATTERN_SEED: u64 = 0x0_0b_5eed;
const PATTERN_EXTENT: i32 = 13;
const HALF_PATCH: i32 = 15;
const HARRIS_BLOCK: i32 = 7;
const HARRIS_K: f32 = 0.04;
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;
/// Smallest border that keeps the rotated sampling pattern and the
/// centroid patch inside the image.
const MIN_BORDER: u32 = 19;

/// Bresenham circle of radius 3 used by the FAST segment test.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
const FAST_ARC: usize = 9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbConfig {
    /// Cap on keypoints retained per image.
    pub max_features: usize,
    pub scale_factor: f32,
    pub levels: usize,
    /// Keypoints closer than this to a level's border are dropped.
    pub edge_threshold: u32,
    pub fast_threshold: u8,
    /// Match count that maps to a score of 1.0.
    pub match_normalizer: f64,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            scale_factor: 1.2,
            levels: 8,
            edge_threshold: 31,
            fast_threshold: 20,
            match_normalizer: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Coordinates within the pyramid level, not the source image.
    pub x: u32,
    pub y: u32,
    pub level: usize,
    pub angle: f32,
    pub response: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor([u64; DESCRIPTOR_WORDS]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Sampling pairs `(x1, y1, x2, y2)` for the binary tests, generated once
/// from a fixed seed so descriptors are comparable across images.
fn sampling_pattern() -> &'static [[i32; 4]; DESCRIPTOR_BITS] {
    static PATTERN: OnceLock<[[i32; 4]; DESCRIPTOR_BITS]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = Pcg32::seed_from_u64(PATTERN_SEED);
        let mut pattern = [[0i32; 4]; DESCRIPTOR_BITS];
        for pair in pattern.iter_mut() {
            loop {
                let candidate = [
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                    rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                ];
                if candidate[..2] != candidate[2..] {
                    *pair = candidate;
                    break;
                }
            }
        }
        pattern
    })
}

/// Per-level keypoint quotas; geometric in `1 / scale_factor`, summing to
/// `max_features`.
fn level_quotas(config: &OrbConfig) -> Vec<usize> {
    let levels = config.levels.max(1);
    let factor = 1.0 / config.scale_factor as f64;
    let mut desired = if (factor - 1.0).abs() < f64::EPSILON {
        config.max_features as f64 / levels as f64
    } else {
        config.max_features as f64 * (1.0 - factor) / (1.0 - factor.powi(levels as i32))
    };

    let mut quotas = Vec::with_capacity(levels);
    let mut assigned = 0usize;
    for _ in 0..levels - 1 {
        let quota = desired.round() as usize;
        quotas.push(quota);
        assigned += quota;
        desired *= factor;
    }
    quotas.push(config.max_features.saturating_sub(assigned));
    quotas
}

fn build_pyramid(image: &GrayImage, scale_factor: f32, levels: usize, border: u32) -> Vec<GrayImage> {
    let (width, height) = image.dimensions();
    let mut pyramid = vec![image.clone()];
    for level in 1..levels.max(1) {
        let scale = scale_factor.powi(level as i32);
        let w = (width as f32 / scale).round() as u32;
        let h = (height as f32 / scale).round() as u32;
        if w <= 2 * border || h <= 2 * border {
            break;
        }
        pyramid.push(imageops::resize(image, w, h, FilterType::Triangle));
    }
    pyramid
}

/// FAST-9 segment test. Returns a corner strength (sum of absolute
/// differences beyond the threshold over the winning arc class) or 0.
fn fast_score(image: &GrayImage, x: u32, y: u32, threshold: u8) -> f32 {
    let center = image.get_pixel(x, y).0[0] as i32;
    let t = threshold as i32;

    let mut classes = [0i8; 16];
    for (i, &(dx, dy)) in CIRCLE.iter().enumerate() {
        let value = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as i32;
        classes[i] = if value > center + t {
            1
        } else if value < center - t {
            -1
        } else {
            0
        };
    }

    let mut best_class = 0i8;
    for class in [1i8, -1] {
        let mut run = 0usize;
        for i in 0..32 {
            if classes[i % 16] == class {
                run += 1;
                if run >= FAST_ARC {
                    best_class = class;
                    break;
                }
            } else {
                run = 0;
            }
        }
        if best_class != 0 {
            break;
        }
    }
    if best_class == 0 {
        return 0.0;
    }

    CIRCLE
        .iter()
        .zip(classes.iter())
        .filter(|(_, c)| **c == best_class)
        .map(|(&(dx, dy), _)| {
            let value = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as i32;
            ((value - center).abs() - t) as f32
        })
        .sum()
}

/// FAST corners with 3x3 non-maximum suppression, skipping `border` pixels.
pub fn detect_fast(image: &GrayImage, threshold: u8, border: u32) -> Vec<(u32, u32, f32)> {
    let (width, height) = image.dimensions();
    let border = border.max(4);
    if width <= 2 * border || height <= 2 * border {
        return Vec::new();
    }

    // Scores are computed one pixel wider than the detection area so the
    // suppression window always has data.
    let (x0, y0, x1, y1) = (border - 1, border - 1, width - border + 1, height - border + 1);
    let stride = (x1 - x0) as usize;
    let mut scores = vec![0.0f32; stride * (y1 - y0) as usize];
    for y in y0..y1 {
        for x in x0..x1 {
            scores[(y - y0) as usize * stride + (x - x0) as usize] = fast_score(image, x, y, threshold);
        }
    }

    let score_at = |x: u32, y: u32| scores[(y - y0) as usize * stride + (x - x0) as usize];
    let mut corners = Vec::new();
    for y in border..height - border {
        for x in border..width - border {
            let score = score_at(x, y);
            if score <= 0.0 {
                continue;
            }
            let is_max = (-1i32..=1).all(|dy| {
                (-1i32..=1).all(|dx| {
                    (dx == 0 && dy == 0)
                        || score_at((x as i32 + dx) as u32, (y as i32 + dy) as u32) <= score
                })
            });
            if is_max {
                corners.push((x, y, score));
            }
        }
    }
    corners
}

/// Harris corner measure over a `HARRIS_BLOCK` window of Sobel gradients.
fn harris_response(image: &GrayImage, x: u32, y: u32) -> f32 {
    let at = |px: i32, py: i32| image.get_pixel(px as u32, py as u32).0[0] as f32;
    let r = HARRIS_BLOCK / 2;
    let (cx, cy) = (x as i32, y as i32);

    let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
    for py in cy - r..=cy + r {
        for px in cx - r..=cx + r {
            let gx = (at(px + 1, py - 1) + 2.0 * at(px + 1, py) + at(px + 1, py + 1))
                - (at(px - 1, py - 1) + 2.0 * at(px - 1, py) + at(px - 1, py + 1));
            let gy = (at(px - 1, py + 1) + 2.0 * at(px, py + 1) + at(px + 1, py + 1))
                - (at(px - 1, py - 1) + 2.0 * at(px, py - 1) + at(px + 1, py - 1));
            sxx += gx * gx;
            syy += gy * gy;
            sxy += gx * gy;
        }
    }

    let det = sxx * syy - sxy * sxy;
    let trace = sxx + syy;
    det - HARRIS_K * trace * trace
}

/// Orientation from the intensity centroid of the circular patch.
fn intensity_centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let (mut m01, mut m10) = (0.0f32, 0.0f32);
    for dy in -HALF_PATCH..=HALF_PATCH {
        for dx in -HALF_PATCH..=HALF_PATCH {
            if dx * dx + dy * dy > HALF_PATCH * HALF_PATCH {
                continue;
            }
            let value = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as f32;
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

fn steered_brief(smoothed: &GrayImage, keypoint: &Keypoint) -> Descriptor {
    let (sin, cos) = keypoint.angle.sin_cos();
    let (cx, cy) = (keypoint.x as f32, keypoint.y as f32);
    let sample = |px: i32, py: i32| {
        let rx = (px as f32 * cos - py as f32 * sin + cx).round() as u32;
        let ry = (px as f32 * sin + py as f32 * cos + cy).round() as u32;
        smoothed.get_pixel(rx, ry).0[0]
    };

    let mut words = [0u64; DESCRIPTOR_WORDS];
    for (bit, [x1, y1, x2, y2]) in sampling_pattern().iter().enumerate() {
        if sample(*x1, *y1) < sample(*x2, *y2) {
            words[bit / 64] |= 1u64 << (bit % 64);
        }
    }
    Descriptor(words)
}

/// Detect up to `max_features` oriented keypoints across the pyramid and
/// compute their descriptors.
pub fn detect_and_describe(image: &GrayImage, config: &OrbConfig) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let border = config.edge_threshold.max(MIN_BORDER);
    let pyramid = build_pyramid(image, config.scale_factor, config.levels, border);
    let quotas = level_quotas(config);

    let mut keypoints = Vec::new();
    let mut descriptors = Vec::new();
    for (level, (layer, &quota)) in pyramid.iter().zip(quotas.iter()).enumerate() {
        if quota == 0 {
            continue;
        }

        let mut candidates: Vec<Keypoint> =
            detect_fast(layer, config.fast_threshold, border)
                .into_iter()
                .map(|(x, y, _)| Keypoint {
                    x,
                    y,
                    level,
                    angle: 0.0,
                    response: harris_response(layer, x, y),
                })
                .collect();
        candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
        candidates.truncate(quota);
        if candidates.is_empty() {
            continue;
        }

        let smoothed = imageops::blur(layer, DESCRIPTOR_BLUR_SIGMA);
        for mut keypoint in candidates {
            keypoint.angle = intensity_centroid_angle(layer, keypoint.x, keypoint.y);
            descriptors.push(steered_brief(&smoothed, &keypoint));
            keypoints.push(keypoint);
        }
    }

    (keypoints, descriptors)
}

fn nearest(query: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32)> {
    let mut best: Option<(usize, u32)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let distance = query.hamming(candidate);
        if best.is_none_or(|(_, d)| distance < d) {
            best = Some((index, distance));
        }
    }
    best
}

/// Brute-force Hamming matching keeping only mutual nearest neighbours.
pub fn cross_check_matches(query: &[Descriptor], train: &[Descriptor]) -> Vec<Match> {
    let backward: Vec<Option<usize>> = train
        .iter()
        .map(|d| nearest(d, query).map(|(i, _)| i))
        .collect();

    query
        .iter()
        .enumerate()
        .filter_map(|(qi, d)| {
            let (ti, distance) = nearest(d, train)?;
            (backward[ti] == Some(qi)).then_some(Match {
                query: qi,
                train: ti,
                distance,
            })
        })
        .collect()
}

/// `min(1, matches / match_normalizer)`; 0 when either side has no
/// descriptors.
pub fn keypoint_score(a: &GrayImage, b: &GrayImage, config: &OrbConfig) -> f64 {
    let ((_, descriptors_a), (_, descriptors_b)) = rayon::join(
        || detect_and_describe(a, config),
        || detect_and_describe(b, config),
    );
    if descriptors_a.is_empty() || descriptors_b.is_empty() {
        log::debug!(
            "No descriptors to match ({} vs {})",
            descriptors_a.len(),
            descriptors_b.len()
        );
        return 0.0;
    }

    let matches = cross_check_matches(&descriptors_a, &descriptors_b);
    log::debug!(
        "{} cross-checked matches from {} x {} descriptors",
        matches.len(),
        descriptors_a.len(),
        descriptors_b.len()
    );
    (matches.len() as f64 / config.match_normalizer).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::luma_bt601;
    use crate::test_support::synthetic_photo;
    use image::Luma;

    fn gray_photo(seed: u64) -> GrayImage {
        luma_bt601(&synthetic_photo(256, 256, seed))
    }

    #[test]
    fn test_level_quotas_sum_to_cap() {
        let config = OrbConfig::default();
        let quotas = level_quotas(&config);
        assert_eq!(quotas.len(), 8);
        assert_eq!(quotas.iter().sum::<usize>(), 500);
        assert!(quotas[0] > quotas[1]);
    }

    #[test]
    fn test_fast_finds_square_corners() {
        let mut img = GrayImage::from_pixel(64, 64, Luma([20]));
        for y in 24..40 {
            for x in 24..40 {
                img.put_pixel(x, y, Luma([220]));
            }
        }
        let corners = detect_fast(&img, 20, 3);
        assert!(!corners.is_empty());
        for &(x, y, _) in &corners {
            assert!((22..=41).contains(&x) && (22..=41).contains(&y));
        }
    }

    #[test]
    fn test_blank_image_has_no_keypoints() {
        let blank = GrayImage::from_pixel(256, 256, Luma([128]));
        let (keypoints, descriptors) = detect_and_describe(&blank, &OrbConfig::default());
        assert!(keypoints.is_empty());
        assert!(descriptors.is_empty());
    }

    #[test]
    fn test_blank_image_scores_zero() {
        let blank = GrayImage::from_pixel(256, 256, Luma([255]));
        let photo = gray_photo(7);
        let config = OrbConfig::default();
        assert_eq!(keypoint_score(&photo, &blank, &config), 0.0);
        assert_eq!(keypoint_score(&blank, &photo, &config), 0.0);
    }

    #[test]
    fn test_keypoints_respect_cap_and_border() {
        let config = OrbConfig {
            max_features: 50,
            ..OrbConfig::default()
        };
        let (keypoints, descriptors) = detect_and_describe(&gray_photo(9), &config);
        assert!(keypoints.len() <= 50);
        assert_eq!(keypoints.len(), descriptors.len());
        let level0 = keypoints.iter().filter(|k| k.level == 0);
        for k in level0 {
            assert!(k.x >= 31 && k.x < 256 - 31);
            assert!(k.y >= 31 && k.y < 256 - 31);
        }
    }

    #[test]
    fn test_self_match_saturates_score() {
        let photo = gray_photo(21);
        let score = keypoint_score(&photo, &photo, &OrbConfig::default());
        assert!(score >= 0.55, "self-match score too low: {score}");
    }

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 0]);
        assert_eq!(a.hamming(&b), 3 + 64);
        assert_eq!(b.hamming(&b), 0);
    }

    #[test]
    fn test_cross_check_rejects_one_sided_matches() {
        let q = [Descriptor([0, 0, 0, 0]), Descriptor([0b1, 0, 0, 0])];
        let t = [Descriptor([0b11, 0, 0, 0])];

        // Both queries are nearest to t[0], but t[0] prefers q[1].
        let matches = cross_check_matches(&q, &t);
        assert_eq!(
            matches,
            vec![Match {
                query: 1,
                train: 0,
                distance: 1
            }]
        );
    }

    #[test]
    fn test_cross_check_with_empty_side() {
        let q = [Descriptor([1, 2, 3, 4])];
        assert!(cross_check_matches(&q, &[]).is_empty());
        assert!(cross_check_matches(&[], &q).is_empty());
    }
}
