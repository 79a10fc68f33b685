use crate::core::embedding::EmbeddingError;
use crate::core::image::DecodeError;
use crate::core::ssim::SignalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("{image}: {source}")]
    Decode {
        image: &'static str,
        #[source]
        source: DecodeError,
    },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Embedding comparison is unavailable: no feature extractor loaded")]
    EmbeddingUnavailable,
}
