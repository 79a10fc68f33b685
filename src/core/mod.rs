// Similarity pipeline
// - image: decoding and the two normalization profiles
// - embedding / onnx: CNN feature vectors and cosine comparison
// - histogram, ssim, orb: the classical signals
// - fusion: weighted decision over the classical signals

pub mod embedding;
pub mod fusion;
pub mod histogram;
pub mod image;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod orb;
pub mod ssim;
