// Autoregressive, temperature-controlled generation.
//
// A piece opens on a code drawn uniformly from the vocabulary (there is no
// start symbol). Every step feeds the latest code and the fixed emotion
// through the model, divides the logits by the temperature, softmaxes them
// and draws the next code multinomially from the project PRNG. Temperatures
// below 1 sharpen the distribution toward the argmax; above 1 flatten it.
// The drawn code becomes the next step's input.
//
// Memory across steps follows `MemoryPolicy`:
// - `Stateless` (default): each step is a fresh length-1 window, so the model
//   only ever sees the previous token.
// - `Carried`: the LSTM state returned by each step is fed into the next,
//   giving the decoder the full history of the piece.
//
// Validation happens before the first draw: temperature finite and positive,
// emotion in range, vocabulary non-empty and no larger than the model's
// output. After that generation cannot fail on its inputs: a drawn code with
// no token (possible only when the vocabulary is smaller than the model's
// output layer) is replaced by code 0's token and logged.

use crate::corpus::EmotionLabel;
use crate::error::{MusicError, Result};
use crate::model::EmotionModel;
use crate::token::Token;
use crate::vocab::Vocabulary;
use moodweaver_prng::MusicRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_GENERATION_LENGTH: usize = 50;

/// Whether recurrent state survives from one generation step to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    #[default]
    Stateless,
    Carried,
}

pub fn validate_temperature(temperature: f64) -> Result<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(MusicError::InvalidTemperature(temperature))
    }
}

/// Softmax of `logits / temperature`, computed in f64 with max subtraction.
///
/// Non-finite logits produce NaN entries; `sample_code` treats those as zero
/// probability.
pub fn temperature_softmax(logits: &[f32], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.iter().map(|&l| l as f64 / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|&x| (x - max).exp()).collect();
    let total: f64 = exps.iter().filter(|e| e.is_finite()).sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Draw one code from `softmax(logits / temperature)`.
///
/// If the distribution is degenerate (every entry zero or NaN) the argmax
/// logit is returned instead. Consumes exactly one PRNG draw.
pub fn sample_code(logits: &[f32], temperature: f64, rng: &mut MusicRng) -> Result<u32> {
    validate_temperature(temperature)?;
    if logits.is_empty() {
        return Err(MusicError::ShapeMismatch("no logits to sample from".into()));
    }
    let probabilities = temperature_softmax(logits, temperature);
    let index = rng
        .sample_weighted(&probabilities)
        .unwrap_or_else(|| argmax(logits));
    Ok(index as u32)
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Samples pieces from a trained model and its vocabulary.
pub struct Generator<'a> {
    model: &'a EmotionModel,
    vocab: &'a Vocabulary,
    memory: MemoryPolicy,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a EmotionModel, vocab: &'a Vocabulary) -> Result<Self> {
        if vocab.is_empty() {
            return Err(MusicError::EmptyVocabulary);
        }
        let model_size = model.config().vocab_size;
        if vocab.len() > model_size {
            return Err(MusicError::VocabularyMismatch {
                vocabulary: vocab.len(),
                model: model_size,
            });
        }
        if vocab.len() < model_size {
            warn!(
                vocabulary = vocab.len(),
                model = model_size,
                "vocabulary is smaller than the model output; some draws will fall back"
            );
        }
        Ok(Generator {
            model,
            vocab,
            memory: MemoryPolicy::default(),
        })
    }

    pub fn with_memory(mut self, memory: MemoryPolicy) -> Self {
        self.memory = memory;
        self
    }

    /// Sample `num_steps` codes. Codes may exceed the vocabulary only when the
    /// model's output is wider than it.
    pub fn generate_codes(
        &self,
        emotion: EmotionLabel,
        num_steps: usize,
        temperature: f64,
        rng: &mut MusicRng,
    ) -> Result<Vec<u32>> {
        validate_temperature(temperature)?;
        emotion.validate(self.model.config().num_emotions)?;

        let mut current = rng.range_usize(0, self.vocab.len()) as u32;
        debug!(seed_code = current, %emotion, num_steps, temperature, memory = ?self.memory, "generating");

        let mut state = match self.memory {
            MemoryPolicy::Carried => Some(self.model.zero_state()?),
            MemoryPolicy::Stateless => None,
        };
        let mut codes = Vec::with_capacity(num_steps);
        for _ in 0..num_steps {
            let logits = match state.take() {
                Some(prev) => {
                    let (logits, next) = self.model.step(emotion, current, &prev)?;
                    state = Some(next);
                    logits
                }
                None => self
                    .model
                    .predict_next(emotion, &[current])?
                    .pop()
                    .unwrap_or_default(),
            };
            current = sample_code(&logits, temperature, rng)?;
            codes.push(current);
        }
        Ok(codes)
    }

    /// Sample `num_steps` tokens.
    pub fn generate(
        &self,
        emotion: EmotionLabel,
        num_steps: usize,
        temperature: f64,
        rng: &mut MusicRng,
    ) -> Result<Vec<Token>> {
        let codes = self.generate_codes(emotion, num_steps, temperature, rng)?;
        Ok(codes.into_iter().map(|code| self.decode(code)).collect())
    }

    fn decode(&self, code: u32) -> Token {
        match self.vocab.token(code) {
            Some(token) => token.clone(),
            None => {
                warn!(code, "sampled code is out of vocabulary, replacing with code 0");
                self.vocab.tokens()[0].clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use candle_core::{DType, Device, Tensor};

    fn vocab(names: &[&str]) -> Vocabulary {
        let tokens: Vec<Token> = names.iter().map(|&n| Token::new(n)).collect();
        Vocabulary::build(&tokens, 1).0
    }

    fn model(vocab_size: usize) -> EmotionModel {
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

    fn uniform_model(vocab_size: usize) -> EmotionModel {
        let mut m = model(vocab_size);
        let device = Device::Cpu;
        m.set_parameter(
            "output.weight",
            &Tensor::zeros((vocab_size, 8), DType::F32, &device).unwrap(),
        )
        .unwrap();
        m.set_parameter(
            "output.bias",
            &Tensor::zeros(vocab_size, DType::F32, &device).unwrap(),
        )
        .unwrap();
        m
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = temperature_softmax(&[1.0, 2.0, 3.0], 1.0);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn low_temperature_concentrates_on_argmax() {
        let logits = [0.5, 2.0, 1.9, -1.0];
        let mut previous = 0.0;
        for t in [2.0, 1.0, 0.5, 0.1, 0.01] {
            let top = temperature_softmax(&logits, t)[1];
            assert!(top > previous, "top mass not increasing at t={t}");
            previous = top;
        }
        assert!(previous > 0.99);

        let mut rng = MusicRng::new(8);
        for _ in 0..500 {
            assert_eq!(sample_code(&logits, 1e-3, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn high_temperature_flattens() {
        let p = temperature_softmax(&[0.0, 5.0], 1e6);
        assert!((p[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn invalid_temperatures_are_rejected() {
        let mut rng = MusicRng::new(0);
        for t in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                sample_code(&[1.0], t, &mut rng),
                Err(MusicError::InvalidTemperature(_))
            ));
        }
    }

    #[test]
    fn degenerate_logits_fall_back_to_argmax() {
        let mut rng = MusicRng::new(0);
        assert_eq!(sample_code(&[0.0, f32::INFINITY, 1.0], 1.0, &mut rng).unwrap(), 1);
        assert_eq!(sample_code(&[f32::NAN, f32::NAN], 1.0, &mut rng).unwrap(), 0);
    }

    #[test]
    fn generates_exactly_the_requested_length() {
        let v = vocab(&["C4", "D4", "E4", "F4", "G4"]);
        let m = model(5);
        let generator = Generator::new(&m, &v).unwrap();
        let mut rng = MusicRng::new(1);
        for k in [0, 1, 17] {
            let tokens = generator.generate(EmotionLabel::new(2), k, 0.8, &mut rng).unwrap();
            assert_eq!(tokens.len(), k);
            assert!(tokens.iter().all(|t| v.contains(t)));
        }
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let v = vocab(&["C4", "D4", "E4", "F4", "G4"]);
        let m = model(5);
        for memory in [MemoryPolicy::Stateless, MemoryPolicy::Carried] {
            let generator = Generator::new(&m, &v).unwrap().with_memory(memory);
            let a = generator
                .generate(EmotionLabel::new(0), 30, 1.0, &mut MusicRng::new(77))
                .unwrap();
            let b = generator
                .generate(EmotionLabel::new(0), 30, 1.0, &mut MusicRng::new(77))
                .unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn rejects_bad_arguments_before_sampling() {
        let v = vocab(&["C4", "D4"]);
        let m = model(2);
        let generator = Generator::new(&m, &v).unwrap();
        let mut rng = MusicRng::new(5);
        let untouched = rng.clone();
        assert!(matches!(
            generator.generate(EmotionLabel::new(4), 10, 1.0, &mut rng),
            Err(MusicError::EmotionOutOfRange { .. })
        ));
        assert!(matches!(
            generator.generate(EmotionLabel::new(0), 10, 0.0, &mut rng),
            Err(MusicError::InvalidTemperature(_))
        ));
        assert_eq!(rng, untouched);
    }

    #[test]
    fn vocabulary_must_fit_the_model() {
        let m = model(2);
        let empty = Vocabulary::build(&[], 1).0;
        assert!(matches!(Generator::new(&m, &empty), Err(MusicError::EmptyVocabulary)));
        let big = vocab(&["A4", "B4", "C4"]);
        assert!(matches!(
            Generator::new(&m, &big),
            Err(MusicError::VocabularyMismatch { vocabulary: 3, model: 2 })
        ));
    }

    #[test]
    fn uniform_logits_sample_uniformly() {
        let v = vocab(&["A4", "B4", "C4", "D4"]);
        let m = uniform_model(4);
        let generator = Generator::new(&m, &v).unwrap();
        let mut rng = MusicRng::new(2024);
        let n = 4000;
        let codes = generator
            .generate_codes(EmotionLabel::new(1), n, 1.0, &mut rng)
            .unwrap();
        let mut counts = [0usize; 4];
        for c in codes {
            counts[c as usize] += 1;
        }
        for (code, &count) in counts.iter().enumerate() {
            let frac = count as f64 / n as f64;
            assert!((0.2..0.3).contains(&frac), "code {code} drawn {frac:.3} of the time");
        }
    }

    #[test]
    fn out_of_vocabulary_draws_fall_back_to_code_zero() {
        // Model predicts 4 codes but only 2 have tokens.
        let v = vocab(&["C4", "D4"]);
        let m = uniform_model(4);
        let generator = Generator::new(&m, &v).unwrap();
        let mut rng = MusicRng::new(9);
        let codes = generator
            .generate_codes(EmotionLabel::new(0), 200, 1.0, &mut rng)
            .unwrap();
        assert!(codes.iter().any(|&c| c >= 2));
        let tokens = generator
            .generate(EmotionLabel::new(0), 200, 1.0, &mut MusicRng::new(9))
            .unwrap();
        assert_eq!(tokens.len(), 200);
        for (code, token) in codes.iter().zip(&tokens) {
            let expected = if *code >= 2 { "C4" } else { v.token(*code).unwrap().as_str() };
            assert_eq!(token.as_str(), expected);
        }
    }
}
