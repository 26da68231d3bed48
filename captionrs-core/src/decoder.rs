use std::{fmt, num::NonZeroUsize, sync::atomic::Ordering};

use candle_core::Tensor;
use tracing::debug;

use crate::{
    vocab::{pad_sequence, TokenCodec, END_TOKEN, START_TOKEN},
    Error, Result, SequencePredictor, DEBUG,
};

/// Why the decode loop ended. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The predictor emitted the end sentinel.
    EndToken,
    /// The arg-max index has no word in the vocabulary.
    UnknownIndex(u32),
    /// The candidate repeats one of the two most recent words.
    Repetition,
    /// All `max_length` steps were used.
    MaxLength,
}

/// A finished caption, sentinels removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    words: Vec<String>,
    stop_reason: StopReason,
    steps: usize,
}

impl Caption {
    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn text(&self) -> String {
        self.words.join(" ")
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Number of predictor queries made.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// The caption with its first character upper-cased and the rest
    /// lower-cased, as shown to API clients.
    pub fn capitalized(&self) -> String {
        let text = self.text();
        let mut chars = text.chars();
        match chars.next() {
            Some(first) => first
                .to_uppercase()
                .chain(chars.flat_map(char::to_lowercase))
                .collect(),
            None => String::new(),
        }
    }
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Index of the largest probability. Ties go to the lowest index and NaNs are
/// skipped.
fn argmax(probs: &[f32]) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &p) in probs.iter().enumerate() {
        if p.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| p > b) {
            best = Some((i, p));
        }
    }
    let (index, _) = best.ok_or_else(|| {
        Error::Inference("predictor returned no usable probabilities".to_string())
    })?;
    u32::try_from(index).map_err(|_| Error::Inference(format!("token index {index} overflows")))
}

/// Greedy caption decoder.
#[derive(Debug, Clone, Copy)]
pub struct CaptionDecoder {
    max_length: NonZeroUsize,
}

impl From<NonZeroUsize> for CaptionDecoder {
    fn from(max_length: NonZeroUsize) -> Self {
        Self { max_length }
    }
}

impl CaptionDecoder {
    pub fn new(max_length: usize) -> Result<Self> {
        NonZeroUsize::new(max_length)
            .map(Self::from)
            .ok_or(Error::InvalidMaxLength)
    }

    pub fn max_length(&self) -> usize {
        self.max_length.get()
    }

    /// Run greedy decoding for one image.
    ///
    /// The whole working text is re-tokenized and re-padded at every step, so
    /// the predictor always sees a sequence of exactly `max_length` indices.
    /// The loop makes at most `max_length` predictor calls.
    pub fn decode<P, V>(&self, features: &Tensor, predictor: &P, vocab: &V) -> Result<Caption>
    where
        P: SequencePredictor + ?Sized,
        V: TokenCodec + ?Sized,
    {
        let max_length = self.max_length.get();
        let mut words = vec![START_TOKEN.to_string()];
        let mut stop_reason = StopReason::MaxLength;
        let mut steps = 0;

        for _ in 0..max_length {
            steps += 1;
            let sequence = pad_sequence(&vocab.texts_to_sequence(&words.join(" ")), max_length);
            let probs = predictor
                .predict(features, &sequence)
                .map_err(|e| match e {
                    Error::Inference(_) => e,
                    other => Error::Inference(other.to_string()),
                })?;
            let index = argmax(&probs)?;

            let Some(word) = vocab.decode(index) else {
                stop_reason = StopReason::UnknownIndex(index);
                break;
            };
            if DEBUG.load(Ordering::Relaxed) {
                debug!("Step {steps}: index {index} -> `{word}`");
            }
            if word == END_TOKEN {
                stop_reason = StopReason::EndToken;
                break;
            }
            if words.iter().rev().take(2).any(|w| w == word) {
                stop_reason = StopReason::Repetition;
                break;
            }
            words.push(word.to_string());
        }

        let words: Vec<String> = words
            .into_iter()
            .filter(|w| w != START_TOKEN && w != END_TOKEN)
            .collect();
        debug!(
            "Decoded {} words in {steps} steps, stopped by {stop_reason:?}.",
            words.len()
        );
        Ok(Caption {
            words,
            stop_reason,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use candle_core::{DType, Device, Tensor};

    use super::{argmax, CaptionDecoder, StopReason};
    use crate::{
        vocab::{pad_sequence, TokenCodec},
        Error, Result, SequencePredictor, Vocabulary,
    };

    /// Emits a fixed series of indices as one-hot distributions.
    struct ScriptedPredictor {
        vocab_size: usize,
        script: Vec<u32>,
        seen: Mutex<Vec<Vec<u32>>>,
    }

    impl ScriptedPredictor {
        fn new(vocab_size: usize, script: &[u32]) -> Self {
            Self {
                vocab_size,
                script: script.to_vec(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl SequencePredictor for ScriptedPredictor {
        fn predict(&self, _features: &Tensor, sequence: &[u32]) -> Result<Vec<f32>> {
            let mut seen = self.seen.lock().unwrap();
            let next = self.script[seen.len() % self.script.len()] as usize;
            seen.push(sequence.to_vec());
            let mut probs = vec![0.01; self.vocab_size.max(next + 1)];
            probs[next] = 0.9;
            Ok(probs)
        }
    }

    struct FailingPredictor;

    impl SequencePredictor for FailingPredictor {
        fn predict(&self, _features: &Tensor, _sequence: &[u32]) -> Result<Vec<f32>> {
            Err(candle_core::Error::Msg("shape mismatch".to_string()).into())
        }
    }

    fn features() -> Tensor {
        Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap()
    }

    fn vocab() -> Vocabulary {
        Vocabulary::from_json(
            r#"{"startseq": 1, "endseq": 2, "a": 3, "dog": 4, "runs": 5, "fast": 6,
                "brown": 7, "home": 8}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_argmax_ties_pick_lowest_index() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]).unwrap(), 1);
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.3]).unwrap(), 2);
        assert!(matches!(argmax(&[]), Err(Error::Inference(_))));
    }

    #[test]
    fn test_decode_until_end_token() {
        let vocab = vocab();
        let predictor = ScriptedPredictor::new(9, &[3, 4, 5, 2]);
        let decoder = CaptionDecoder::new(34).unwrap();
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a dog runs");
        assert_eq!(caption.capitalized(), "A dog runs");
        assert_eq!(caption.stop_reason(), StopReason::EndToken);
        assert_eq!(caption.steps(), 4);
    }

    #[test]
    fn test_decode_retokenizes_and_pads_each_step() {
        let vocab = vocab();
        let predictor = ScriptedPredictor::new(9, &[3, 4, 2]);
        let decoder = CaptionDecoder::new(5).unwrap();
        decoder.decode(&features(), &predictor, &vocab).unwrap();
        let seen = predictor.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                vec![1, 0, 0, 0, 0],
                vec![1, 3, 0, 0, 0],
                vec![1, 3, 4, 0, 0],
            ]
        );
    }

    #[test]
    fn test_decode_exhausts_max_length() {
        let vocab = vocab();
        let predictor = ScriptedPredictor::new(9, &[3, 7, 4, 5, 6, 8]);
        let decoder = CaptionDecoder::new(5).unwrap();
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a brown dog runs fast");
        assert_eq!(caption.words().len(), 5);
        assert_eq!(caption.stop_reason(), StopReason::MaxLength);
        assert_eq!(predictor.calls(), 5);
    }

    #[test]
    fn test_decode_never_exceeds_max_length() {
        let vocab = vocab();
        for max_length in 1..=8 {
            let predictor = ScriptedPredictor::new(9, &[3, 4, 5, 6, 7, 8]);
            let decoder = CaptionDecoder::new(max_length).unwrap();
            let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
            assert!(caption.steps() <= max_length);
            assert!(predictor.calls() <= max_length);
            let resequenced = vocab.texts_to_sequence(&caption.text());
            assert!(pad_sequence(&resequenced, max_length).len() <= max_length);
        }
    }

    #[test]
    fn test_decode_stops_on_repetition() {
        let vocab = vocab();
        let predictor = ScriptedPredictor::new(9, &[3, 4, 4, 4]);
        let decoder = CaptionDecoder::new(10).unwrap();
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a dog");
        assert_eq!(caption.stop_reason(), StopReason::Repetition);

        // A word two positions back also counts.
        let predictor = ScriptedPredictor::new(9, &[3, 4, 3]);
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a dog");
        assert_eq!(caption.stop_reason(), StopReason::Repetition);

        // Further back is allowed.
        let predictor = ScriptedPredictor::new(9, &[3, 4, 5, 3, 2]);
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a dog runs a");
    }

    #[test]
    fn test_decode_stops_on_unknown_index() {
        let vocab = vocab();
        let predictor = ScriptedPredictor::new(9, &[3, 42]);
        let decoder = CaptionDecoder::new(10).unwrap();
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a");
        assert_eq!(caption.stop_reason(), StopReason::UnknownIndex(42));

        // Padding index has no word either.
        let predictor = ScriptedPredictor::new(9, &[0]);
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert!(caption.words().is_empty());
        assert_eq!(caption.capitalized(), "");
    }

    #[test]
    fn test_caption_never_contains_sentinels() {
        let vocab = vocab();
        // `startseq` right away is caught as a repetition.
        let predictor = ScriptedPredictor::new(9, &[1]);
        let decoder = CaptionDecoder::new(6).unwrap();
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert!(caption.words().is_empty());

        // Later on it is appended, then stripped.
        let predictor = ScriptedPredictor::new(9, &[3, 4, 1, 5, 2]);
        let caption = decoder.decode(&features(), &predictor, &vocab).unwrap();
        assert_eq!(caption.text(), "a dog runs");
        assert!(!caption.text().contains("startseq"));
        assert!(!caption.text().contains("endseq"));
    }

    #[test]
    fn test_predictor_failure_is_inference_error() {
        let vocab = vocab();
        let decoder = CaptionDecoder::new(3).unwrap();
        let res = decoder.decode(&features(), &FailingPredictor, &vocab);
        assert!(matches!(res, Err(Error::Inference(msg)) if msg.contains("shape mismatch")));
    }

    #[test]
    fn test_zero_max_length_rejected() {
        assert!(matches!(
            CaptionDecoder::new(0),
            Err(Error::InvalidMaxLength)
        ));
    }
}
