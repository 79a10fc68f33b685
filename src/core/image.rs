use image::{imageops, imageops::FilterType, GrayImage, Luma, RgbImage};
use ndarray::Array4;
use thiserror::Error;

/// Shorter side after the isotropic resize of the embedding profile.
pub const RESIZE_SHORTER_SIDE: u32 = 256;
/// Square crop fed to the network.
pub const CROP_SIZE: u32 = 224;
/// Per-channel statistics of the network's training distribution (ImageNet).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty image buffer")]
    Empty,

    #[error("not a decodable image: {0}")]
    Image(#[from] image::ImageError),
}

/// A decoded upload, canonicalized to 8-bit RGB.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    rgb: RgbImage,
}

/// Both rasters of the classical profile, resized to a common square size.
#[derive(Debug, Clone)]
pub struct ClassicalImage {
    pub color: RgbImage,
    pub gray: GrayImage,
}

/// Decode raw encoded bytes (any format the `image` crate understands) into RGB.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let img = image::load_from_memory(bytes)?;
    Ok(DecodedImage { rgb: img.to_rgb8() })
}

impl DecodedImage {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self { rgb }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// Resize shorter side to 256, center-crop 224, scale to [0,1] and
    /// standardize with the ImageNet statistics. Shape is `[1, 3, 224, 224]`.
    ///
    /// The crop is taken in source coordinates and only that square is
    /// resampled, so the cost is bounded by the crop regardless of aspect
    /// ratio.
    pub fn to_embedding_tensor(&self) -> Array4<f32> {
        let (width, height) = self.rgb.dimensions();
        let (x, y, side) = center_crop_region(width, height);
        let square = imageops::crop_imm(&self.rgb, x, y, side, side).to_image();
        let cropped = imageops::resize(&square, CROP_SIZE, CROP_SIZE, FilterType::Triangle);

        let size = CROP_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (px, py, pixel) in cropped.enumerate_pixels() {
            for (c, &value) in pixel.0.iter().enumerate() {
                let scaled = value as f32 / 255.0;
                tensor[[0, c, py as usize, px as usize]] =
                    (scaled - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        tensor
    }

    /// Resize to `size x size` and derive the luminance raster alongside.
    pub fn to_classical(&self, size: u32) -> ClassicalImage {
        let color = imageops::resize(&self.rgb, size, size, FilterType::Triangle);
        let gray = luma_bt601(&color);
        ClassicalImage { color, gray }
    }
}

/// Luminance with the BT.601 weights, rounded to the nearest integer.
pub fn luma_bt601(rgb: &RgbImage) -> GrayImage {
    let (width, height) = rgb.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luminance = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([luminance.round().clamp(0.0, 255.0) as u8])
    })
}

/// Source-space square `(x, y, side)` that the shorter-side resize to 256
/// followed by a centered 224 crop would keep.
fn center_crop_region(width: u32, height: u32) -> (u32, u32, u32) {
    let short = u64::from(width.min(height).max(1));
    let side = (short * u64::from(CROP_SIZE) + u64::from(RESIZE_SHORTER_SIDE) / 2)
        / u64::from(RESIZE_SHORTER_SIDE);
    let side = side.clamp(1, short);
    let offset = |length: u32| (u64::from(length).saturating_sub(side) + 1) / 2;

    let to_u32 = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
    (to_u32(offset(width)), to_u32(offset(height)), to_u32(side))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{encode_png, solid_image};
    use image::Rgb;

    #[test]
    fn test_empty_buffer_is_decode_error() {
        assert!(matches!(decode(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_garbage_bytes_are_decode_error() {
        let result = decode(b"definitely not an image");
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_decode_png_roundtrip_dimensions() {
        let bytes = encode_png(&solid_image(40, 30, [10, 20, 30]));
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
        assert_eq!(decoded.as_rgb().get_pixel(5, 5), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_center_crop_region() {
        assert_eq!(center_crop_region(640, 480), (110, 30, 420));
        assert_eq!(center_crop_region(480, 640), (30, 110, 420));
        assert_eq!(center_crop_region(256, 256), (16, 16, 224));
        assert_eq!(center_crop_region(100, 100), (6, 6, 88));
    }

    #[test]
    fn test_center_crop_region_extreme_aspect() {
        assert_eq!(center_crop_region(1, 100_000), (0, 50_000, 1));
        assert_eq!(center_crop_region(1, 20_000_000), (0, 10_000_000, 1));
        assert_eq!(center_crop_region(u32::MAX, 3), (2_147_483_646, 0, 3));
    }

    #[test]
    fn test_embedding_tensor_for_extreme_strip() {
        let strip = encode_png(&solid_image(1, 100_000, [10, 200, 30]));
        let tensor = decode(&strip).unwrap().to_embedding_tensor();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        let expected_g = (200.0 / 255.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((tensor[[0, 1, 0, 0]] - expected_g).abs() < 1e-4);
        assert!((tensor[[0, 1, 223, 223]] - expected_g).abs() < 1e-4);
    }

    #[test]
    fn test_embedding_tensor_drops_side_margins() {
        let img = RgbImage::from_fn(640, 256, |x, _| {
            if x < 100 || x >= 540 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let tensor = DecodedImage::from_rgb(img).to_embedding_tensor();

        let blue = (1.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        for x in [0, 112, 223] {
            assert!((tensor[[0, 2, 112, x]] - blue).abs() < 1e-4);
        }
    }

    #[test]
    fn test_embedding_tensor_shape_for_wide_image() {
        let decoded = DecodedImage::from_rgb(solid_image(640, 480, [0, 0, 0]));
        let tensor = decoded.to_embedding_tensor();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_embedding_tensor_standardization() {
        let decoded = DecodedImage::from_rgb(solid_image(300, 500, [255, 128, 0]));
        let tensor = decoded.to_embedding_tensor();

        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_g = (128.0 / 255.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        let expected_b = (0.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];

        assert!((tensor[[0, 0, 100, 100]] - expected_r).abs() < 1e-4);
        assert!((tensor[[0, 1, 100, 100]] - expected_g).abs() < 1e-4);
        assert!((tensor[[0, 2, 100, 100]] - expected_b).abs() < 1e-4);
    }

    #[test]
    fn test_classical_profile_resizes_to_square() {
        let decoded = DecodedImage::from_rgb(solid_image(640, 120, [200, 100, 50]));
        let classical = decoded.to_classical(256);
        assert_eq!(classical.color.dimensions(), (256, 256));
        assert_eq!(classical.gray.dimensions(), (256, 256));
    }

    #[test]
    fn test_luma_bt601_weights() {
        let gray = luma_bt601(&solid_image(2, 2, [255, 0, 0]));
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);

        let gray = luma_bt601(&solid_image(2, 2, [0, 255, 0]));
        assert_eq!(gray.get_pixel(1, 1).0[0], 150);

        let gray = luma_bt601(&solid_image(2, 2, [255, 255, 255]));
        assert_eq!(gray.get_pixel(0, 1).0[0], 255);
    }
}
