// Training and evaluation loops.
//
// The trainer owns the model for the duration of training: nothing else can
// read the parameters while an update step is in flight. Each epoch reshuffles
// the windows, cuts full batches, and for every batch runs a forward pass with
// dropout, computes cross-entropy over all `B·T` positions, and takes one Adam
// step (AdamW with zero weight decay). The epoch's mean batch loss is logged
// and returned. `fit` calls back after every epoch so the caller can stop
// early; nothing is interruptible mid-epoch.
//
// Two objectives are supported:
// - `Reconstruct`: the target at every position is the window's own code at
//   that position. The model sees the whole window as input, including the
//   code it must predict. This is the default.
// - `NextToken`: the usual shifted language-model objective; inputs are
//   positions `0..L-1` and targets `1..L`.
//
// Evaluation runs the same forward pass without dropout or updates and
// reports mean loss and exact-match accuracy (argmax vs. target, over every
// individual position).
//
// A batch that does not match the model (label count, code range, emotion
// range) aborts the call with the underlying error.

use crate::batch::{Batch, shuffled_batches};
use crate::error::{MusicError, Result};
use crate::model::EmotionModel;
use crate::window::Window;
use candle_core::{D, DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use moodweaver_prng::MusicRng;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tracing::{debug, info};

pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
pub const DEFAULT_EPOCHS: usize = 50;

/// What each position is trained to predict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Each position predicts its own code from the full window.
    #[default]
    Reconstruct,
    /// Each position predicts the following code.
    NextToken,
}

impl Objective {
    /// Split a `(B, L)` code tensor into model inputs and targets.
    fn split(self, codes: &Tensor) -> Result<(Tensor, Tensor)> {
        match self {
            Objective::Reconstruct => Ok((codes.clone(), codes.clone())),
            Objective::NextToken => {
                let (_, len) = codes.dims2()?;
                if len < 2 {
                    return Err(MusicError::ShapeMismatch(
                        "next-token training needs windows of at least 2 codes".into(),
                    ));
                }
                Ok((codes.narrow(1, 0, len - 1)?, codes.narrow(1, 1, len - 1)?))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpochReport {
    /// 1-based epoch number.
    pub epoch: usize,
    pub mean_loss: f32,
    pub batches: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    /// Fraction of positions whose argmax prediction equals the target.
    pub accuracy: f32,
    pub positions: usize,
}

/// How `Trainer::fit` iterates.
#[derive(Clone, Debug)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
}

pub struct Trainer {
    model: EmotionModel,
    optimizer: AdamW,
    objective: Objective,
}

impl Trainer {
    pub fn new(model: EmotionModel, learning_rate: f64, objective: Objective) -> Result<Self> {
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(MusicError::Config(format!(
                "learning rate must be finite and > 0, got {learning_rate}"
            )));
        }
        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(model.trainable_vars(), params)?;
        Ok(Trainer {
            model,
            optimizer,
            objective,
        })
    }

    pub fn model(&self) -> &EmotionModel {
        &self.model
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    /// Finish training and hand the frozen model back.
    pub fn into_model(self) -> EmotionModel {
        self.model
    }

    /// One optimizer step on one batch. Returns the batch loss.
    pub fn train_batch(&mut self, batch: &Batch) -> Result<f32> {
        let (loss, _, _) = batch_loss(&self.model, batch, self.objective, true)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Train on every batch once. Returns the mean batch loss.
    pub fn train_epoch(&mut self, batches: &[Batch]) -> Result<f32> {
        if batches.is_empty() {
            return Err(MusicError::Config("no batches to train on".into()));
        }
        let mut total = 0.0;
        for (i, batch) in batches.iter().enumerate() {
            let loss = self.train_batch(batch)?;
            debug!(batch = i, loss, "trained batch");
            total += loss;
        }
        Ok(total / batches.len() as f32)
    }

    /// Train for `options.epochs`, reshuffling every epoch. `on_epoch` may
    /// return `ControlFlow::Break` to stop after the current epoch.
    pub fn fit(
        &mut self,
        windows: &[Window],
        options: &FitOptions,
        rng: &mut MusicRng,
        mut on_epoch: impl FnMut(&EpochReport) -> ControlFlow<()>,
    ) -> Result<Vec<EpochReport>> {
        if options.batch_size == 0 || windows.len() < options.batch_size {
            return Err(MusicError::Config(format!(
                "{} windows cannot fill a batch of {}",
                windows.len(),
                options.batch_size
            )));
        }
        info!(
            windows = windows.len(),
            batch_size = options.batch_size,
            epochs = options.epochs,
            parameters = self.model.parameter_count(),
            objective = ?self.objective,
            "training"
        );

        let mut reports = Vec::with_capacity(options.epochs);
        for epoch in 1..=options.epochs {
            let batches =
                shuffled_batches(windows, options.batch_size, rng, self.model.device())?;
            let mean_loss = self.train_epoch(&batches)?;
            info!("Epoch [{epoch}/{}], Loss: {mean_loss:.4}", options.epochs);
            let report = EpochReport {
                epoch,
                mean_loss,
                batches: batches.len(),
            };
            let flow = on_epoch(&report);
            reports.push(report);
            if flow.is_break() {
                info!(epoch, "stopping early");
                break;
            }
        }
        info!("training complete");
        Ok(reports)
    }
}

/// Mean loss and per-position accuracy without dropout or updates.
pub fn evaluate(model: &EmotionModel, batches: &[Batch], objective: Objective) -> Result<Evaluation> {
    if batches.is_empty() {
        return Err(MusicError::Config("no batches to evaluate".into()));
    }
    let mut total_loss = 0.0;
    let mut correct = 0.0;
    let mut positions = 0;
    for batch in batches {
        let (loss, logits, targets) = batch_loss(model, batch, objective, false)?;
        total_loss += loss.to_scalar::<f32>()?;
        let predictions = logits.argmax(D::Minus1)?;
        correct += predictions
            .eq(&targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        positions += targets.dims1()?;
    }
    let evaluation = Evaluation {
        loss: total_loss / batches.len() as f32,
        accuracy: correct / positions as f32,
        positions,
    };
    info!(
        "Validation Loss: {:.4}, Accuracy: {:.2}%",
        evaluation.loss,
        evaluation.accuracy * 100.0
    );
    Ok(evaluation)
}

/// Forward one batch; returns (scalar loss, `(N,V)` logits, `(N,)` targets).
fn batch_loss(
    model: &EmotionModel,
    batch: &Batch,
    objective: Objective,
    train: bool,
) -> Result<(Tensor, Tensor, Tensor)> {
    model.check_batch(batch)?;
    let (inputs, targets) = objective.split(batch.codes())?;
    let logits = model.forward_t(batch.emotions(), &inputs, train)?;
    let (b, t, v) = logits.dims3()?;
    let logits = logits.reshape((b * t, v))?;
    let targets = targets.contiguous()?.reshape((b * t,))?;
    let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
    Ok((loss, logits, targets))
}
