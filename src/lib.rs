pub mod config;
pub mod core;
pub mod error;
pub mod services;

#[cfg(test)]
mod test_support;

pub use config::Settings;
pub use core::embedding::{Embedding, EmbeddingError, FeatureExtractor};
pub use core::fusion::{FusionOutcome, FusionPolicy, SignalTriple};
pub use error::CompareError;
pub use services::ComparisonService;
