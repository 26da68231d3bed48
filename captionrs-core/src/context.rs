use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};

use candle_core::Device;
use tracing::{error, info, warn};

use crate::{
    classify, preprocess_image, resolve_max_length, ActionLabel, Caption, CaptionDecoder,
    CaptionModel, CaptionModelConfig, ImageEncoder, MergeCaptioner, Result, TokenCodec,
    Vocabulary, END_TOKEN, START_TOKEN,
};

/// Everything needed to bring the pipeline up at startup.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub model_path: PathBuf,
    /// Architecture description. Defaults apply when `None`.
    pub model_config_path: Option<PathBuf>,
    pub vocab_path: PathBuf,
    pub max_length: Option<NonZeroUsize>,
    pub device: Device,
}

/// Result of one successful request.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub action: ActionLabel,
    pub annotation: String,
    pub caption: Caption,
}

/// Read-only state shared by every request.
pub struct CaptionContext {
    vocabulary: Vocabulary,
    model: Arc<dyn CaptionModel>,
    decoder: CaptionDecoder,
    image_size: usize,
    device: Device,
}

impl CaptionContext {
    pub fn new(
        vocabulary: Vocabulary,
        model: Arc<dyn CaptionModel>,
        decoder: CaptionDecoder,
        image_size: usize,
        device: Device,
    ) -> Self {
        Self {
            vocabulary,
            model,
            decoder,
            image_size,
            device,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn max_length(&self) -> usize {
        self.decoder.max_length()
    }

    /// Caption an encoded image and classify the caption.
    pub fn annotate(&self, image_bytes: &[u8]) -> Result<Annotation> {
        let pixels = preprocess_image(image_bytes, self.image_size, &self.device)?;
        let features = self.model.encode(&pixels)?;
        let caption = self
            .decoder
            .decode(&features, self.model.as_ref(), &self.vocabulary)?;
        let action = classify(&caption.text());
        Ok(Annotation {
            action,
            annotation: caption.capitalized(),
            caption,
        })
    }
}

/// Every decode starts from `startseq` and may stop on `endseq`, so the model
/// must have an output class for both.
fn check_sentinels(vocabulary: &Vocabulary, classes: usize) -> std::result::Result<(), String> {
    for sentinel in [START_TOKEN, END_TOKEN] {
        let index = vocabulary.encode(sentinel);
        if index as usize >= classes {
            return Err(format!(
                "`{sentinel}` has index {index} but the model predicts only {classes} classes"
            ));
        }
    }
    Ok(())
}

/// Why startup left the service degraded.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub reason: String,
    pub model_loaded: bool,
    pub vocabulary_loaded: bool,
    /// Decode length that would have been used.
    pub max_length: NonZeroUsize,
}

pub enum LoadState {
    Loaded(Arc<CaptionContext>),
    LoadFailed(LoadFailure),
}

impl LoadState {
    /// Load the vocabulary, then the model. Failures are reported in the
    /// returned state rather than as an error so the service can keep
    /// running degraded.
    pub fn load(opts: &LoadOptions) -> Self {
        let vocabulary = Vocabulary::from_file(&opts.vocab_path).map_err(|e| {
            format!(
                "cannot load vocabulary `{}`: {e}",
                opts.vocab_path.display()
            )
        });
        let max_length = resolve_max_length(vocabulary.as_ref().ok(), opts.max_length);

        let config = match &opts.model_config_path {
            Some(path) => CaptionModelConfig::from_file(path).map_err(|e| {
                format!("cannot read model config `{}`: {e}", path.display())
            }),
            None => Ok(CaptionModelConfig::default()),
        };
        let model = config.clone().and_then(|config| {
            let vocab_size = match (config.vocab_size, &vocabulary) {
                (Some(n), _) => n,
                (None, Ok(vocab)) => vocab.index_bound(),
                (None, Err(_)) => {
                    return Err("model vocabulary size is unknown without a vocabulary".to_string())
                }
            };
            MergeCaptioner::load(&config, vocab_size, &opts.model_path, &opts.device)
                .map_err(|e| format!("cannot load model `{}`: {e}", opts.model_path.display()))
        });
        let model = model.and_then(|model| match &vocabulary {
            Ok(vocab) => check_sentinels(vocab, model.vocab_size()).map(|()| model),
            Err(_) => Ok(model),
        });

        match (vocabulary, model, config) {
            (Ok(vocabulary), Ok(model), Ok(config)) => {
                if model.vocab_size() < vocabulary.index_bound() {
                    warn!(
                        "Model predicts {} classes but the vocabulary uses indices up to {}.",
                        model.vocab_size(),
                        vocabulary.index_bound() - 1
                    );
                }
                info!("Model loaded successfully! Max length: {max_length}");
                let ctx = CaptionContext::new(
                    vocabulary,
                    Arc::new(model),
                    CaptionDecoder::from(max_length),
                    config.image_size,
                    opts.device.clone(),
                );
                Self::Loaded(Arc::new(ctx))
            }
            (vocabulary, model, _) => {
                let reason = [vocabulary.as_ref().err(), model.as_ref().err()]
                    .into_iter()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ");
                error!("Error loading model: {reason}");
                warn!("Serving degraded; falling back to max length {max_length}.");
                Self::LoadFailed(LoadFailure {
                    reason,
                    model_loaded: model.is_ok(),
                    vocabulary_loaded: vocabulary.is_ok(),
                    max_length,
                })
            }
        }
    }

    pub fn context(&self) -> Option<&Arc<CaptionContext>> {
        match self {
            Self::Loaded(ctx) => Some(ctx),
            Self::LoadFailed(_) => None,
        }
    }

    pub fn model_loaded(&self) -> bool {
        match self {
            Self::Loaded(_) => true,
            Self::LoadFailed(failure) => failure.model_loaded,
        }
    }

    pub fn vocabulary_loaded(&self) -> bool {
        match self {
            Self::Loaded(_) => true,
            Self::LoadFailed(failure) => failure.vocabulary_loaded,
        }
    }
}
