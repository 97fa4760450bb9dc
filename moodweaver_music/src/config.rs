// Data-driven pipeline configuration.
//
// Every tunable of the pipeline lives in `MusicConfig`, grouped by stage and
// loadable from JSON. All sections and fields default, so a config file only
// needs the values it changes; `{}` is a valid config. Command-line flags
// (main.rs) override individual fields after loading.
//
// Shape parameters (`model`) are only read when a model is created. A trained
// model is always rebuilt from its checkpoint manifest, never from this file,
// so editing `model` cannot corrupt an existing checkpoint.

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::corpus::{DEFAULT_LABEL_COLUMN, EmotionLabel};
use crate::error::{MusicError, Result};
use crate::generate::{DEFAULT_GENERATION_LENGTH, DEFAULT_TEMPERATURE, MemoryPolicy, validate_temperature};
use crate::midi::{DEFAULT_TEMPO_BPM, MIN_TEMPO_BPM};
use crate::model::{
    DEFAULT_DROPOUT, DEFAULT_EMOTION_DIM, DEFAULT_HIDDEN_DIM, DEFAULT_NUM_EMOTIONS,
    DEFAULT_TOKEN_DIM, ModelConfig,
};
use crate::train::{DEFAULT_EPOCHS, DEFAULT_LEARNING_RATE, Objective};
use crate::vocab::DEFAULT_RARITY_THRESHOLD;
use crate::window::DEFAULT_WINDOW_LENGTH;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Corpus preparation: filtering, windowing, labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusParams {
    /// Tokens seen fewer times than this across the corpus are dropped.
    pub rarity_threshold: usize,
    /// Tokens per training window.
    pub window_length: usize,
    /// Label table column holding 1-based emotion classes.
    pub label_column: String,
    pub num_emotions: usize,
}

impl Default for CorpusParams {
    fn default() -> Self {
        CorpusParams {
            rarity_threshold: DEFAULT_RARITY_THRESHOLD,
            window_length: DEFAULT_WINDOW_LENGTH,
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
            num_emotions: DEFAULT_NUM_EMOTIONS,
        }
    }
}

/// Network shape for newly created models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub token_dim: usize,
    pub emotion_dim: usize,
    pub hidden_dim: usize,
    pub dropout: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        ModelParams {
            token_dim: DEFAULT_TOKEN_DIM,
            emotion_dim: DEFAULT_EMOTION_DIM,
            hidden_dim: DEFAULT_HIDDEN_DIM,
            dropout: DEFAULT_DROPOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Windows per optimizer step; the trailing partial batch is dropped.
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub objective: Objective,
    /// Seed for batch shuffling. `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        TrainingParams {
            batch_size: DEFAULT_BATCH_SIZE,
            epochs: DEFAULT_EPOCHS,
            learning_rate: DEFAULT_LEARNING_RATE,
            objective: Objective::default(),
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Tokens to generate.
    pub length: usize,
    pub temperature: f64,
    /// Zero-based emotion class.
    pub emotion: u32,
    pub memory: MemoryPolicy,
    /// Seed for the opening token and every draw. `None` seeds from the clock.
    pub seed: Option<u64>,
    pub tempo_bpm: u16,
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            length: DEFAULT_GENERATION_LENGTH,
            temperature: DEFAULT_TEMPERATURE,
            emotion: 0,
            memory: MemoryPolicy::default(),
            seed: None,
            tempo_bpm: DEFAULT_TEMPO_BPM,
        }
    }
}

/// Where tensors live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChoice {
    #[default]
    Cpu,
    /// First CUDA device, falling back to CPU when unavailable.
    Cuda,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicConfig {
    pub corpus: CorpusParams,
    pub model: ModelParams,
    pub training: TrainingParams,
    pub generation: GenerationParams,
    pub device: DeviceChoice,
}

impl MusicConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: MusicConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("corpus.window_length", self.corpus.window_length),
            ("corpus.num_emotions", self.corpus.num_emotions),
            ("training.batch_size", self.training.batch_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(MusicError::Config(format!("{name} must be at least 1")));
        }
        if !(self.training.learning_rate.is_finite() && self.training.learning_rate > 0.0) {
            return Err(MusicError::Config(format!(
                "training.learning_rate must be finite and > 0, got {}",
                self.training.learning_rate
            )));
        }
        if self.generation.tempo_bpm < MIN_TEMPO_BPM {
            return Err(MusicError::Config(format!(
                "generation.tempo_bpm must be at least {MIN_TEMPO_BPM}, got {}",
                self.generation.tempo_bpm
            )));
        }
        validate_temperature(self.generation.temperature)?;
        EmotionLabel::new(self.generation.emotion).validate(self.corpus.num_emotions)?;
        // Shape checks reuse the model's own validation with a placeholder vocabulary.
        self.model_config(1).validate()
    }

    /// Model shape for a freshly built vocabulary of `vocab_size` tokens.
    pub fn model_config(&self, vocab_size: usize) -> ModelConfig {
        ModelConfig {
            vocab_size,
            num_emotions: self.corpus.num_emotions,
            token_dim: self.model.token_dim,
            emotion_dim: self.model.emotion_dim,
            hidden_dim: self.model.hidden_dim,
            dropout: self.model.dropout,
        }
    }

    pub fn device(&self) -> Result<Device> {
        Ok(match self.device {
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda => Device::cuda_if_available(0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MusicConfig::default();
        assert_eq!(config.corpus.rarity_threshold, 100);
        assert_eq!(config.corpus.window_length, 50);
        assert_eq!(config.model.token_dim, 128);
        assert_eq!(config.model.emotion_dim, 64);
        assert_eq!(config.model.hidden_dim, 256);
        assert_eq!(config.model.dropout, 0.3);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.learning_rate, 0.001);
        assert_eq!(config.generation.temperature, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_is_the_default_config() {
        let config: MusicConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MusicConfig::default());
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let json = r#"{
            "corpus": { "rarity_threshold": 5 },
            "training": { "objective": "next_token", "seed": 7 },
            "generation": { "memory": "carried", "emotion": 2 },
            "device": "cuda"
        }"#;
        let config: MusicConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.corpus.rarity_threshold, 5);
        assert_eq!(config.corpus.window_length, 50);
        assert_eq!(config.training.objective, Objective::NextToken);
        assert_eq!(config.training.seed, Some(7));
        assert_eq!(config.generation.memory, MemoryPolicy::Carried);
        assert_eq!(config.device, DeviceChoice::Cuda);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = MusicConfig::default();
        config.generation.temperature = 0.0;
        assert!(matches!(config.validate(), Err(MusicError::InvalidTemperature(_))));

        let mut config = MusicConfig::default();
        config.generation.emotion = 4;
        assert!(matches!(config.validate(), Err(MusicError::EmotionOutOfRange { .. })));

        let mut config = MusicConfig::default();
        config.corpus.window_length = 0;
        assert!(matches!(config.validate(), Err(MusicError::Config(_))));

        let mut config = MusicConfig::default();
        config.generation.tempo_bpm = 2;
        assert!(matches!(config.validate(), Err(MusicError::Config(_))));
        config.generation.tempo_bpm = MIN_TEMPO_BPM;
        assert!(config.validate().is_ok());

        let mut config = MusicConfig::default();
        config.model.dropout = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn model_config_carries_shape() {
        let config = MusicConfig::default();
        let model = config.model_config(321);
        assert_eq!(model.vocab_size, 321);
        assert_eq!(model.num_emotions, 4);
        assert_eq!(model.hidden_dim, 256);
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "training": { "epochs": 3 } }"#).unwrap();
        let config = MusicConfig::load(&path).unwrap();
        assert_eq!(config.training.epochs, 3);

        std::fs::write(&path, r#"{ "training": { "batch_size": 0 } }"#).unwrap();
        assert!(MusicConfig::load(&path).is_err());
    }
}
