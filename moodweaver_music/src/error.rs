// Error taxonomy for the music pipeline.
//
// Recoverable conditions (a window containing an unknown token, a sampled
// code with no reverse mapping, an unlabeled source file) never reach this
// type: they are skipped or substituted at the point of detection and logged
// with `tracing::warn!`. Everything here fails the whole call.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MusicError {
    /// A batch's windows and labels disagree in count, or its windows differ
    /// in length. Indicates a data-construction bug upstream.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("temperature must be finite and > 0, got {0}")]
    InvalidTemperature(f64),

    #[error("emotion label {label} out of range 0..{num_emotions}")]
    EmotionOutOfRange { label: u32, num_emotions: usize },

    #[error("token code {code} out of range 0..{vocab_size}")]
    CodeOutOfRange { code: u32, vocab_size: usize },

    /// A raw (1-based) label that cannot be normalized.
    #[error("invalid emotion label {raw:?}: {reason}")]
    InvalidLabel { raw: String, reason: String },

    #[error("vocabulary is empty")]
    EmptyVocabulary,

    #[error("vocabulary has {vocabulary} tokens but the model predicts {model} codes")]
    VocabularyMismatch { vocabulary: usize, model: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed token {0:?}")]
    MalformedToken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MIDI error: {0}")]
    Midi(#[from] midly::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MusicError>;
