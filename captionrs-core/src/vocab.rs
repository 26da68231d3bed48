use std::{collections::HashMap, fs, num::NonZeroUsize, path::Path};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

/// Sentinel opening every caption.
pub const START_TOKEN: &str = "startseq";
/// Sentinel the model emits when the caption is finished.
pub const END_TOKEN: &str = "endseq";
/// Reserved index for padding and for words outside the vocabulary.
pub const PAD_INDEX: u32 = 0;
/// Caption length used when it cannot be derived from the vocabulary.
pub const DEFAULT_MAX_LENGTH: usize = 34;

const FILTERS: &str = "!\"#$%&()*+,-./:;<=>?@[\\]^_`{|}~\t\n";

/// Total mapping between words and vocabulary indices.
pub trait TokenCodec {
    /// Index of `token`, or [`PAD_INDEX`] when the word is unknown.
    fn encode(&self, token: &str) -> u32;

    /// Word stored at `index`, if any.
    fn decode(&self, index: u32) -> Option<&str>;

    /// Split `text` into words and encode each of them.
    fn texts_to_sequence(&self, text: &str) -> Vec<u32> {
        split_words(text).iter().map(|w| self.encode(w)).collect()
    }
}

/// Lower-case `text`, blank out punctuation and split on whitespace.
pub(crate) fn split_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if FILTERS.contains(c) { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

/// Pad `sequence` with [`PAD_INDEX`] at the end up to `max_length`.
///
/// Longer sequences keep their last `max_length` entries.
pub fn pad_sequence(sequence: &[u32], max_length: usize) -> Vec<u32> {
    let start = sequence.len().saturating_sub(max_length);
    let mut padded = sequence[start..].to_vec();
    padded.resize(max_length, PAD_INDEX);
    padded
}

#[derive(Deserialize)]
struct KerasTokenizerConfig {
    word_index: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VocabularyFile {
    Keras {
        class_name: String,
        config: KerasTokenizerConfig,
    },
    WithMetadata {
        word_index: IndexMap<String, u32>,
        max_length: Option<usize>,
    },
    Plain(IndexMap<String, u32>),
}

/// Word-level vocabulary with the `startseq`/`endseq` sentinels.
///
/// Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    word_index: HashMap<String, u32>,
    index_word: HashMap<u32, String>,
    declared_max_length: Option<usize>,
}

impl Vocabulary {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let vocab = Self::from_json(&raw)?;
        info!(
            "Loaded vocabulary of {} words from `{}`.",
            vocab.len(),
            path.display()
        );
        Ok(vocab)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        match serde_json::from_str::<VocabularyFile>(raw)? {
            VocabularyFile::Keras { class_name, config } => {
                if class_name != "Tokenizer" {
                    warn!("Vocabulary file declares class `{class_name}`, expected `Tokenizer`.");
                }
                let word_index: IndexMap<String, u32> = serde_json::from_str(&config.word_index)?;
                Self::from_word_index(word_index, None)
            }
            VocabularyFile::WithMetadata {
                word_index,
                max_length,
            } => Self::from_word_index(word_index, max_length),
            VocabularyFile::Plain(word_index) => Self::from_word_index(word_index, None),
        }
    }

    /// Build a vocabulary, checking that index 0 is unused, indices are
    /// unique and both sentinels are present.
    pub fn from_word_index(
        word_index: impl IntoIterator<Item = (String, u32)>,
        declared_max_length: Option<usize>,
    ) -> Result<Self> {
        let mut words = HashMap::new();
        let mut index_word = HashMap::new();
        for (word, index) in word_index {
            if index == PAD_INDEX {
                return Err(Error::Vocabulary(format!(
                    "`{word}` uses the reserved index {PAD_INDEX}"
                )));
            }
            if let Some(other) = index_word.insert(index, word.clone()) {
                return Err(Error::Vocabulary(format!(
                    "index {index} is shared by `{other}` and `{word}`"
                )));
            }
            words.insert(word, index);
        }
        for sentinel in [START_TOKEN, END_TOKEN] {
            if !words.contains_key(sentinel) {
                return Err(Error::Vocabulary(format!(
                    "missing sentinel token `{sentinel}`"
                )));
            }
        }
        Ok(Self {
            word_index: words,
            index_word,
            declared_max_length,
        })
    }

    pub fn len(&self) -> usize {
        self.word_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_index.is_empty()
    }

    /// One past the largest index in use; the smallest output size a model
    /// needs to cover this vocabulary.
    pub fn index_bound(&self) -> usize {
        self.index_word
            .keys()
            .max()
            .map_or(1, |&max| max as usize + 1)
    }

    pub fn declared_max_length(&self) -> Option<usize> {
        self.declared_max_length
    }

    /// Length of the longest tokenized vocabulary entry.
    pub fn longest_entry(&self) -> usize {
        self.word_index
            .keys()
            .map(|w| self.texts_to_sequence(w).len())
            .max()
            .unwrap_or(0)
    }
}

impl TokenCodec for Vocabulary {
    fn encode(&self, token: &str) -> u32 {
        self.word_index.get(token).copied().unwrap_or(PAD_INDEX)
    }

    fn decode(&self, index: u32) -> Option<&str> {
        self.index_word.get(&index).map(String::as_str)
    }
}

/// Decide the decode length `L`.
///
/// An explicit override wins, then the length declared in the vocabulary
/// file, then the longest vocabulary entry. [`DEFAULT_MAX_LENGTH`] is used
/// when there is no vocabulary or nothing else yields a positive value.
pub fn resolve_max_length(
    vocab: Option<&Vocabulary>,
    max_length_override: Option<NonZeroUsize>,
) -> NonZeroUsize {
    let fallback = NonZeroUsize::new(DEFAULT_MAX_LENGTH).unwrap_or(NonZeroUsize::MIN);
    if let Some(max_length) = max_length_override {
        return max_length;
    }
    let Some(vocab) = vocab else {
        return fallback;
    };
    vocab
        .declared_max_length()
        .and_then(NonZeroUsize::new)
        .or_else(|| NonZeroUsize::new(vocab.longest_entry()))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::{
        pad_sequence, resolve_max_length, split_words, TokenCodec, Vocabulary,
        DEFAULT_MAX_LENGTH, PAD_INDEX,
    };
    use crate::Error;

    fn vocab() -> Vocabulary {
        Vocabulary::from_json(
            r#"{"startseq": 1, "endseq": 2, "a": 3, "dog": 4, "runs": 5, "fast": 6}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let vocab = vocab();
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.encode("dog"), 4);
        assert_eq!(vocab.encode("cat"), PAD_INDEX);
        assert_eq!(vocab.decode(5), Some("runs"));
        assert_eq!(vocab.decode(0), None);
        assert_eq!(vocab.decode(99), None);
    }

    #[test]
    fn test_texts_to_sequence() {
        let vocab = vocab();
        assert_eq!(
            vocab.texts_to_sequence("startseq A dog, runs  FAST!"),
            vec![1, 3, 4, 5, 6]
        );
        assert_eq!(vocab.texts_to_sequence("a cat runs"), vec![3, 0, 5]);
        assert!(vocab.texts_to_sequence("").is_empty());
    }

    #[test]
    fn test_split_words_filters_punctuation() {
        assert_eq!(split_words("t-shirt\tand\njeans."), ["t", "shirt", "and", "jeans"]);
    }

    #[test]
    fn test_pad_sequence() {
        assert_eq!(pad_sequence(&[1, 3], 4), vec![1, 3, 0, 0]);
        assert_eq!(pad_sequence(&[1, 3, 4, 5], 4), vec![1, 3, 4, 5]);
        // Overlong input keeps its tail.
        assert_eq!(pad_sequence(&[1, 3, 4, 5, 6], 3), vec![4, 5, 6]);
        assert_eq!(pad_sequence(&[], 2), vec![0, 0]);
    }

    #[test]
    fn test_keras_export() {
        let raw = r#"{
            "class_name": "Tokenizer",
            "config": {
                "num_words": null,
                "lower": true,
                "word_index": "{\"startseq\": 1, \"endseq\": 2, \"a\": 3}",
                "index_word": "{\"1\": \"startseq\", \"2\": \"endseq\", \"3\": \"a\"}"
            }
        }"#;
        let vocab = Vocabulary::from_json(raw).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.decode(3), Some("a"));
    }

    #[test]
    fn test_rejects_invalid_vocabularies() {
        let reserved = Vocabulary::from_json(r#"{"startseq": 1, "endseq": 2, "a": 0}"#);
        assert!(matches!(reserved, Err(Error::Vocabulary(_))));

        let duplicate = Vocabulary::from_json(r#"{"startseq": 1, "endseq": 2, "a": 2}"#);
        assert!(matches!(duplicate, Err(Error::Vocabulary(_))));

        let no_sentinel = Vocabulary::from_json(r#"{"startseq": 1, "a": 2}"#);
        assert!(matches!(no_sentinel, Err(Error::Vocabulary(_))));
    }

    #[test]
    fn test_resolve_max_length() {
        let plain = vocab();
        assert_eq!(resolve_max_length(Some(&plain), None).get(), 1);
        assert_eq!(
            resolve_max_length(Some(&plain), NonZeroUsize::new(7)).get(),
            7
        );
        assert_eq!(resolve_max_length(None, None).get(), DEFAULT_MAX_LENGTH);

        let declared = Vocabulary::from_json(
            r#"{"word_index": {"startseq": 1, "endseq": 2}, "max_length": 12}"#,
        )
        .unwrap();
        assert_eq!(resolve_max_length(Some(&declared), None).get(), 12);

        let multi_word = Vocabulary::from_word_index(
            [
                ("startseq".to_string(), 1),
                ("endseq".to_string(), 2),
                ("t-shirt".to_string(), 3),
                ("t".to_string(), 4),
            ],
            None,
        )
        .unwrap();
        assert_eq!(multi_word.longest_entry(), 2);
    }
}
