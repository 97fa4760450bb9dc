// Emotion-conditioned recurrent sequence model.
//
// Two independent embedding tables, one over vocabulary codes (`d_t`) and
// one over emotion classes (`d_e`). The emotion vector of each example is
// broadcast along the time axis and concatenated after every position's token
// embedding, so the recurrent stack sees the emotion at every step instead of
// only through its initial state. The stack is two LSTM layers of width `h`
// with dropout between them; dropout is applied again to the top layer's
// output, and a linear projection maps each hidden vector to `V` unnormalized
// logits. Dropout is active only when `train` is set.
//
//   codes (B,T) ──embed──> (B,T,d_t) ─┐
//                                     ├─ cat ─> LSTM ─> drop ─> LSTM ─> drop ─> linear ─> (B,T,V)
//   emotion (B) ─embed──> (B,d_e) ────┘  (broadcast over T)
//
// Parameters live in a candle `VarMap` under stable names (`token_embedding`,
// `emotion_embedding`, `lstm0`, `lstm1`, `output`); checkpoint.rs saves and
// restores that map. The map carries no hyperparameters, so reloading needs
// an identical `ModelConfig`.
//
// Single-example entry points (`predict_next`, `step`) validate the emotion
// label and codes against the configured ranges before building any tensor.
// `step` threads an explicit `RecurrentState` so generation can either carry
// memory across steps or start from a zero state every time (generate.rs).

use crate::batch::Batch;
use crate::corpus::EmotionLabel;
use crate::error::{MusicError, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::rnn::{LSTM, LSTMConfig, LSTMState};
use candle_nn::{Dropout, Embedding, Linear, Module, ModuleT, RNN, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Depth of the recurrent stack. Not configurable.
pub const RECURRENT_LAYERS: usize = 2;

pub const DEFAULT_TOKEN_DIM: usize = 128;
pub const DEFAULT_EMOTION_DIM: usize = 64;
pub const DEFAULT_HIDDEN_DIM: usize = 256;
pub const DEFAULT_DROPOUT: f32 = 0.3;
pub const DEFAULT_NUM_EMOTIONS: usize = 4;

/// Shape hyperparameters. Everything needed to rebuild the parameter map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Output dimension and token embedding rows. Equals the vocabulary size.
    pub vocab_size: usize,
    pub num_emotions: usize,
    pub token_dim: usize,
    pub emotion_dim: usize,
    pub hidden_dim: usize,
    /// Drop probability between LSTM layers and before the projection.
    pub dropout: f32,
}

impl ModelConfig {
    /// Default dimensions for the given vocabulary and emotion counts.
    pub fn new(vocab_size: usize, num_emotions: usize) -> Self {
        ModelConfig {
            vocab_size,
            num_emotions,
            token_dim: DEFAULT_TOKEN_DIM,
            emotion_dim: DEFAULT_EMOTION_DIM,
            hidden_dim: DEFAULT_HIDDEN_DIM,
            dropout: DEFAULT_DROPOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("vocab_size", self.vocab_size),
            ("num_emotions", self.num_emotions),
            ("token_dim", self.token_dim),
            ("emotion_dim", self.emotion_dim),
            ("hidden_dim", self.hidden_dim),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(MusicError::Config(format!("{name} must be at least 1")));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(MusicError::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Per-layer LSTM state carried between single steps.
#[derive(Clone, Debug)]
pub struct RecurrentState {
    layers: Vec<LSTMState>,
}

pub struct EmotionModel {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    token_embedding: Embedding,
    emotion_embedding: Embedding,
    layers: Vec<LSTM>,
    dropout: Dropout,
    output: Linear,
}

impl EmotionModel {
    /// Fresh, randomly initialized model on `device`.
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let token_embedding =
            candle_nn::embedding(config.vocab_size, config.token_dim, vb.pp("token_embedding"))?;
        let emotion_embedding = candle_nn::embedding(
            config.num_emotions,
            config.emotion_dim,
            vb.pp("emotion_embedding"),
        )?;

        let mut layers = Vec::with_capacity(RECURRENT_LAYERS);
        let mut input_dim = config.token_dim + config.emotion_dim;
        for i in 0..RECURRENT_LAYERS {
            layers.push(candle_nn::rnn::lstm(
                input_dim,
                config.hidden_dim,
                LSTMConfig::default(),
                vb.pp(format!("lstm{i}")),
            )?);
            input_dim = config.hidden_dim;
        }

        let output = candle_nn::linear(config.hidden_dim, config.vocab_size, vb.pp("output"))?;

        Ok(EmotionModel {
            dropout: Dropout::new(config.dropout),
            config,
            device: device.clone(),
            varmap,
            token_embedding,
            emotion_embedding,
            layers,
            output,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable variables, for the optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn parameter_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Overwrite one named parameter in place, e.g. `output.bias`.
    pub fn set_parameter(&mut self, name: &str, value: &Tensor) -> Result<()> {
        self.varmap.set_one(name, value)?;
        Ok(())
    }

    /// Write all parameters as safetensors. No hyperparameters are stored.
    pub fn save_parameters(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Replace all parameters with those in a safetensors file written by a
    /// model of identical configuration.
    pub fn load_parameters(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }

    /// Batched forward pass: emotions `(B,)`, codes `(B,T)` → logits `(B,T,V)`.
    pub fn forward_t(&self, emotions: &Tensor, codes: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, steps) = codes.dims2()?;
        let tokens = self.token_embedding.forward(codes)?;
        let emotion = self
            .emotion_embedding
            .forward(emotions)?
            .unsqueeze(1)?
            .broadcast_as((batch, steps, self.config.emotion_dim))?
            .contiguous()?;
        let mut xs = Tensor::cat(&[&tokens, &emotion], 2)?;

        for (i, layer) in self.layers.iter().enumerate() {
            let states = layer.seq(&xs)?;
            xs = layer.states_to_tensor(&states)?;
            if i + 1 < self.layers.len() {
                xs = self.dropout.forward_t(&xs, train)?;
            }
        }
        let xs = self.dropout.forward_t(&xs, train)?;
        Ok(self.output.forward(&xs)?)
    }

    /// Check a batch against the model's shape and label ranges.
    pub fn check_batch(&self, batch: &Batch) -> Result<()> {
        let (rows, _) = batch.codes().dims2()?;
        let labels = batch.emotions().dims1()?;
        if rows != labels {
            return Err(MusicError::ShapeMismatch(format!(
                "{rows} windows but {labels} labels"
            )));
        }
        if let Some(&label) = batch
            .emotions()
            .to_vec1::<u32>()?
            .iter()
            .find(|&&l| l as usize >= self.config.num_emotions)
        {
            return Err(MusicError::EmotionOutOfRange {
                label,
                num_emotions: self.config.num_emotions,
            });
        }
        let max_code = batch.codes().flatten_all()?.max(0)?.to_scalar::<u32>()?;
        self.check_code(max_code)
    }

    /// Logits for every position of one sequence, `T × V`.
    pub fn predict_next(&self, emotion: EmotionLabel, codes: &[u32]) -> Result<Vec<Vec<f32>>> {
        emotion.validate(self.config.num_emotions)?;
        if codes.is_empty() {
            return Err(MusicError::ShapeMismatch("empty token sequence".into()));
        }
        for &code in codes {
            self.check_code(code)?;
        }
        let codes = Tensor::from_vec(codes.to_vec(), (1, codes.len()), &self.device)?;
        let emotions = Tensor::new(&[emotion.index()], &self.device)?;
        let logits = self.forward_t(&emotions, &codes, false)?;
        Ok(logits.squeeze(0)?.to_vec2::<f32>()?)
    }

    /// All-zero recurrent state for a single sequence.
    pub fn zero_state(&self) -> Result<RecurrentState> {
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.zero_state(1))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(RecurrentState { layers })
    }

    /// Advance one timestep from `state`; returns the logits and the new state.
    pub fn step(
        &self,
        emotion: EmotionLabel,
        code: u32,
        state: &RecurrentState,
    ) -> Result<(Vec<f32>, RecurrentState)> {
        emotion.validate(self.config.num_emotions)?;
        self.check_code(code)?;
        if state.layers.len() != self.layers.len() {
            return Err(MusicError::ShapeMismatch(format!(
                "state has {} layers, model has {}",
                state.layers.len(),
                self.layers.len()
            )));
        }

        let code = Tensor::new(&[code], &self.device)?;
        let emotion = Tensor::new(&[emotion.index()], &self.device)?;
        let tokens = self.token_embedding.forward(&code)?;
        let emotion = self.emotion_embedding.forward(&emotion)?;
        let mut xs = Tensor::cat(&[&tokens, &emotion], 1)?;

        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, prev) in self.layers.iter().zip(&state.layers) {
            let s = layer.step(&xs, prev)?;
            xs = s.h().clone();
            next.push(s);
        }
        let logits = self.output.forward(&xs)?.squeeze(0)?.to_vec1::<f32>()?;
        Ok((logits, RecurrentState { layers: next }))
    }

    fn check_code(&self, code: u32) -> Result<()> {
        if (code as usize) < self.config.vocab_size {
            Ok(())
        } else {
            Err(MusicError::CodeOutOfRange {
                code,
                vocab_size: self.config.vocab_size,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(vocab_size: usize) -> EmotionModel {
        let config = ModelConfig {
            vocab_size,
            num_emotions: 4,
            token_dim: 6,
            emotion_dim: 3,
            hidden_dim: 8,
            dropout: 0.3,
        };
        EmotionModel::new(config, &Device::Cpu).unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn forward_shape_is_batch_time_vocab() {
        let model = tiny(10);
        let codes = Tensor::new(&[[1u32, 2, 3, 4, 5], [5, 4, 3, 2, 1]], &Device::Cpu).unwrap();
        let emotions = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        let logits = model.forward_t(&emotions, &codes, true).unwrap();
        assert_eq!(logits.dims3().unwrap(), (2, 5, 10));
    }

    #[test]
    fn inference_is_deterministic() {
        let model = tiny(7);
        let a = model.predict_next(EmotionLabel::new(1), &[0, 3, 6]).unwrap();
        let b = model.predict_next(EmotionLabel::new(1), &[0, 3, 6]).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].len(), 7);
        assert_eq!(a, b);
    }

    #[test]
    fn emotion_changes_the_output() {
        let model = tiny(7);
        let a = model.predict_next(EmotionLabel::new(0), &[2]).unwrap();
        let b = model.predict_next(EmotionLabel::new(3), &[2]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn out_of_range_inputs_are_rejected() {
        let model = tiny(5);
        assert!(matches!(
            model.predict_next(EmotionLabel::new(4), &[0]),
            Err(MusicError::EmotionOutOfRange { label: 4, num_emotions: 4 })
        ));
        assert!(matches!(
            model.predict_next(EmotionLabel::new(0), &[5]),
            Err(MusicError::CodeOutOfRange { code: 5, .. })
        ));
        assert!(model.predict_next(EmotionLabel::new(0), &[]).is_err());
        let state = model.zero_state().unwrap();
        assert!(model.step(EmotionLabel::new(9), 0, &state).is_err());
    }

    #[test]
    fn step_from_zero_matches_single_position_window() {
        let model = tiny(6);
        let emotion = EmotionLabel::new(2);
        let window = model.predict_next(emotion, &[4]).unwrap();
        let (stepped, _) = model.step(emotion, 4, &model.zero_state().unwrap()).unwrap();
        assert_close(&window[0], &stepped);
    }

    #[test]
    fn carried_state_matches_full_window() {
        let model = tiny(6);
        let emotion = EmotionLabel::new(1);
        let window = model.predict_next(emotion, &[3, 0, 5]).unwrap();
        let mut state = model.zero_state().unwrap();
        let mut last = Vec::new();
        for code in [3, 0, 5] {
            let (logits, next) = model.step(emotion, code, &state).unwrap();
            last = logits;
            state = next;
        }
        assert_close(&window[2], &last);
    }

    #[test]
    fn zeroed_projection_gives_uniform_logits() {
        let mut model = tiny(4);
        let device = Device::Cpu;
        model
            .set_parameter("output.weight", &Tensor::zeros((4, 8), DType::F32, &device).unwrap())
            .unwrap();
        model
            .set_parameter("output.bias", &Tensor::zeros(4, DType::F32, &device).unwrap())
            .unwrap();
        let logits = model.predict_next(EmotionLabel::new(0), &[1, 2]).unwrap();
        assert!(logits.iter().flatten().all(|&x| x == 0.0));
    }

    #[test]
    fn config_validation() {
        let mut config = ModelConfig::new(10, 4);
        assert!(config.validate().is_ok());
        config.dropout = 1.0;
        assert!(config.validate().is_err());
        let config = ModelConfig::new(0, 4);
        assert!(matches!(config.validate(), Err(MusicError::Config(_))));
    }

    #[test]
    fn parameter_count_covers_every_layer() {
        let model = tiny(10);
        // embeddings + 2 LSTM layers (4 gates each) + projection
        let lstm = |i: usize| 4 * 8 * i + 4 * 8 * 8 + 2 * 4 * 8;
        let expected = 10 * 6 + 4 * 3 + lstm(9) + lstm(8) + 8 * 10 + 10;
        assert_eq!(model.parameter_count(), expected);
    }
}
