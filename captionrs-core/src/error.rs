use thiserror::Error;

/// Errors produced while loading or running the captioning pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// The uploaded bytes could not be decoded as an image.
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),

    /// The vocabulary file is well-formed JSON but violates an invariant.
    #[error("invalid vocabulary: {0}")]
    Vocabulary(String),

    #[error("model loading failed: {0}")]
    ModelLoad(String),

    /// The predictor returned something the decoder cannot use.
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("maximum caption length must be at least 1")]
    InvalidMaxLength,
}

pub type Result<T> = std::result::Result<T, Error>;
