use candle_core::Tensor;

use crate::Result;

/// Turns a preprocessed image batch into the feature representation the
/// predictor consumes.
pub trait ImageEncoder {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;
}

/// Next-token model of the captioning pipeline.
///
/// Implementations must tolerate concurrent calls through `&self`: requests
/// decode in parallel against one shared instance.
pub trait SequencePredictor {
    /// Probability distribution over the vocabulary for the token following
    /// `sequence`, which is already padded to the decode length.
    fn predict(&self, features: &Tensor, sequence: &[u32]) -> Result<Vec<f32>>;
}

/// A complete captioning model shared between request handlers.
pub trait CaptionModel: ImageEncoder + SequencePredictor + Send + Sync {}

impl<T: ImageEncoder + SequencePredictor + Send + Sync> CaptionModel for T {}
