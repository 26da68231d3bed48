use std::{fs, path::Path};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{
    ops::softmax_last_dim,
    rnn::{lstm, LSTMConfig, LSTM, RNN},
    Conv2d, Conv2dConfig, Embedding, Linear, VarBuilder,
};
use serde::Deserialize;
use tracing::info;

use crate::{
    serde_default_fn, vocab::PAD_INDEX, Error, ImageEncoder, Result, SequencePredictor,
    IMAGE_SIZE,
};

serde_default_fn!(usize, d_embedding_dim, 256);
serde_default_fn!(usize, d_hidden_dim, 256);
serde_default_fn!(usize, d_image_size, IMAGE_SIZE);
serde_default_fn!(Vec<usize>, d_encoder_channels, vec![32, 64, 128]);
serde_default_fn!(bool, d_mask_zero, true);

/// Architecture of [`MergeCaptioner`].
#[derive(Debug, Clone, Deserialize)]
pub struct CaptionModelConfig {
    /// Output classes. Derived from the vocabulary when absent.
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "d_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "d_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "d_image_size")]
    pub image_size: usize,
    #[serde(default = "d_encoder_channels")]
    pub encoder_channels: Vec<usize>,
    /// Read the text state at the last non-padding position instead of the
    /// last position.
    #[serde(default = "d_mask_zero")]
    pub mask_zero: bool,
}

impl Default for CaptionModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: None,
            embedding_dim: d_embedding_dim(),
            hidden_dim: d_hidden_dim(),
            image_size: d_image_size(),
            encoder_channels: d_encoder_channels(),
            mask_zero: d_mask_zero(),
        }
    }
}

impl CaptionModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

// Strided convolutions, global average pool, projection to the merge width.
#[derive(Debug, Clone)]
struct ImageBranch {
    convs: Vec<Conv2d>,
    proj: Linear,
}

impl ImageBranch {
    fn new(cfg: &CaptionModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let mut convs = Vec::with_capacity(cfg.encoder_channels.len());
        let mut in_channels = 3;
        let vb_c = vb.pp("convs");
        for (i, &out_channels) in cfg.encoder_channels.iter().enumerate() {
            convs.push(candle_nn::conv2d(
                in_channels,
                out_channels,
                3,
                conv_cfg,
                vb_c.pp(i),
            )?);
            in_channels = out_channels;
        }
        let proj = candle_nn::linear(in_channels, cfg.hidden_dim, vb.pp("proj"))?;
        Ok(Self { convs, proj })
    }
}

impl Module for ImageBranch {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for conv in &self.convs {
            xs = conv.forward(&xs)?.relu()?;
        }
        self.proj.forward(&xs.mean((2, 3))?)?.relu()
    }
}

/// Encoder-decoder captioning model in the "merge" layout: image features and
/// an LSTM summary of the partial caption are added, then projected onto the
/// vocabulary.
///
/// Forward passes only read weights, so one instance serves concurrent
/// requests without locking.
#[derive(Debug, Clone)]
pub struct MergeCaptioner {
    image: ImageBranch,
    embedding: Embedding,
    lstm: LSTM,
    fc: Linear,
    out: Linear,
    mask_zero: bool,
    vocab_size: usize,
    device: Device,
}

impl MergeCaptioner {
    pub fn new(cfg: &CaptionModelConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        if vocab_size == 0 {
            return Err(Error::ModelLoad("vocabulary size must be positive".to_string()));
        }
        let image = ImageBranch::new(cfg, vb.pp("encoder"))?;
        let embedding = candle_nn::embedding(vocab_size, cfg.embedding_dim, vb.pp("embedding"))?;
        let lstm = lstm(
            cfg.embedding_dim,
            cfg.hidden_dim,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let fc = candle_nn::linear(cfg.hidden_dim, cfg.hidden_dim, vb.pp("head.fc"))?;
        let out = candle_nn::linear(cfg.hidden_dim, vocab_size, vb.pp("head.out"))?;
        Ok(Self {
            image,
            embedding,
            lstm,
            fc,
            out,
            mask_zero: cfg.mask_zero,
            vocab_size,
            device: vb.device().clone(),
        })
    }

    /// Load weights from a safetensors file.
    pub fn load(
        cfg: &CaptionModelConfig,
        vocab_size: usize,
        weights: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let weights = weights.as_ref();
        // SAFETY: the weights file is not modified while the process runs.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        let model = Self::new(cfg, vocab_size, vb)
            .map_err(|e| Error::ModelLoad(format!("{}: {e}", weights.display())))?;
        info!(
            "Loaded captioning model from `{}` ({} output classes).",
            weights.display(),
            vocab_size
        );
        Ok(model)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn text_state(&self, sequence: &[u32]) -> candle_core::Result<Tensor> {
        let ids = Tensor::new(sequence, &self.device)?.unsqueeze(0)?;
        let embedded = self.embedding.forward(&ids)?;
        let states = self.lstm.seq(&embedded)?;
        let position = if self.mask_zero {
            sequence
                .iter()
                .rposition(|&i| i != PAD_INDEX)
                .unwrap_or(0)
        } else {
            states.len().saturating_sub(1)
        };
        match states.get(position) {
            Some(state) => Ok(state.h().clone()),
            None => candle_core::bail!("empty token sequence"),
        }
    }
}

impl ImageEncoder for MergeCaptioner {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let pixels = pixels.to_device(&self.device)?.to_dtype(DType::F32)?;
        Ok(self.image.forward(&pixels)?)
    }
}

impl SequencePredictor for MergeCaptioner {
    fn predict(&self, features: &Tensor, sequence: &[u32]) -> Result<Vec<f32>> {
        if let Some(&bad) = sequence.iter().find(|&&i| i as usize >= self.vocab_size) {
            return Err(Error::Inference(format!(
                "token index {bad} is outside the model vocabulary of {}",
                self.vocab_size
            )));
        }
        let text = self.text_state(sequence)?;
        let merged = features.broadcast_add(&text)?;
        let hidden = self.fc.forward(&merged)?.relu()?;
        let logits = self.out.forward(&hidden)?;
        let probs = softmax_last_dim(&logits)?
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        Ok(probs)
    }
}
