use std::sync::atomic::AtomicBool;

mod classifier;
mod context;
mod decoder;
mod error;
mod logging;
mod model;
mod predictor;
mod preprocess;
mod utils;
mod vocab;

pub use classifier::{classify, ActionLabel};
pub use context::{Annotation, CaptionContext, LoadFailure, LoadOptions, LoadState};
pub use decoder::{Caption, CaptionDecoder, StopReason};
pub use error::{Error, Result};
pub use logging::initialize_logging;
pub use model::{CaptionModelConfig, MergeCaptioner};
pub use predictor::{CaptionModel, ImageEncoder, SequencePredictor};
pub use preprocess::{preprocess_image, IMAGE_SIZE};
pub use vocab::{
    pad_sequence, resolve_max_length, TokenCodec, Vocabulary, DEFAULT_MAX_LENGTH, END_TOKEN,
    PAD_INDEX, START_TOKEN,
};

/// `true` if `CAPTIONRS_DEBUG=1`
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
