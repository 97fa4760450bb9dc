// Mini-batches of windows as tensors.
//
// A batch is `B` windows stacked into a `(B, L)` u32 code tensor plus a `(B,)`
// u32 emotion tensor, both on the model's device. Construction checks that
// window and label counts agree and that every window has the same length;
// a violation is a `ShapeMismatch` and is never patched up.
//
// Training batches are drawn from a shuffled index order each epoch; the
// trailing partial batch is dropped so every optimizer step sees exactly
// `batch_size` examples.

use crate::corpus::EmotionLabel;
use crate::error::{MusicError, Result};
use crate::window::Window;
use candle_core::{Device, Tensor};
use moodweaver_prng::MusicRng;

/// Default number of windows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 16;

#[derive(Clone, Debug)]
pub struct Batch {
    codes: Tensor,
    emotions: Tensor,
}

impl Batch {
    /// Stack `codes[i]` (labelled `emotions[i]`) into tensors on `device`.
    pub fn new(codes: &[Vec<u32>], emotions: &[EmotionLabel], device: &Device) -> Result<Self> {
        if codes.len() != emotions.len() {
            return Err(MusicError::ShapeMismatch(format!(
                "{} windows but {} labels",
                codes.len(),
                emotions.len()
            )));
        }
        let Some(first) = codes.first() else {
            return Err(MusicError::ShapeMismatch("batch has no windows".into()));
        };
        let length = first.len();
        if length == 0 {
            return Err(MusicError::ShapeMismatch("windows are empty".into()));
        }
        if let Some((i, w)) = codes.iter().enumerate().find(|(_, w)| w.len() != length) {
            return Err(MusicError::ShapeMismatch(format!(
                "window {i} has length {}, expected {length}",
                w.len()
            )));
        }

        let size = codes.len();
        let flat: Vec<u32> = codes.iter().flatten().copied().collect();
        let labels: Vec<u32> = emotions.iter().map(|e| e.index()).collect();
        Ok(Batch {
            codes: Tensor::from_vec(flat, (size, length), device)?,
            emotions: Tensor::from_vec(labels, (size,), device)?,
        })
    }

    pub fn from_windows(windows: &[&Window], device: &Device) -> Result<Self> {
        let codes: Vec<Vec<u32>> = windows.iter().map(|w| w.codes.clone()).collect();
        let emotions: Vec<EmotionLabel> = windows.iter().map(|w| w.emotion).collect();
        Self::new(&codes, &emotions, device)
    }

    /// `(B, L)` u32 codes.
    pub fn codes(&self) -> &Tensor {
        &self.codes
    }

    /// `(B,)` u32 emotion labels.
    pub fn emotions(&self) -> &Tensor {
        &self.emotions
    }
}

/// Shuffle `windows` and cut them into full batches of `batch_size`.
pub fn shuffled_batches(
    windows: &[Window],
    batch_size: usize,
    rng: &mut MusicRng,
    device: &Device,
) -> Result<Vec<Batch>> {
    let mut order: Vec<usize> = (0..windows.len()).collect();
    rng.shuffle(&mut order);
    batches_in_order(windows, &order, batch_size, device)
}

/// Full batches in the windows' own order (used for evaluation).
pub fn ordered_batches(windows: &[Window], batch_size: usize, device: &Device) -> Result<Vec<Batch>> {
    let order: Vec<usize> = (0..windows.len()).collect();
    batches_in_order(windows, &order, batch_size, device)
}

fn batches_in_order(
    windows: &[Window],
    order: &[usize],
    batch_size: usize,
    device: &Device,
) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(MusicError::Config("batch size must be at least 1".into()));
    }
    order
        .chunks_exact(batch_size)
        .map(|chunk| {
            let members: Vec<&Window> = chunk.iter().map(|&i| &windows[i]).collect();
            Batch::from_windows(&members, device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(codes: &[u32], emotion: u32) -> Window {
        Window {
            codes: codes.to_vec(),
            emotion: EmotionLabel::new(emotion),
        }
    }

    #[test]
    fn batch_tensors_have_expected_shapes() {
        let batch = Batch::new(
            &[vec![1, 2, 3], vec![4, 5, 6]],
            &[EmotionLabel::new(0), EmotionLabel::new(3)],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(batch.codes().dims2().unwrap(), (2, 3));
        assert_eq!(batch.emotions().to_vec1::<u32>().unwrap(), vec![0, 3]);
    }

    #[test]
    fn label_count_mismatch_is_fatal() {
        let err = Batch::new(&[vec![1], vec![2]], &[EmotionLabel::new(0)], &Device::Cpu).unwrap_err();
        assert!(matches!(err, MusicError::ShapeMismatch(_)));
    }

    #[test]
    fn ragged_windows_are_fatal() {
        let err = Batch::new(
            &[vec![1, 2], vec![3]],
            &[EmotionLabel::new(0), EmotionLabel::new(0)],
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, MusicError::ShapeMismatch(_)));
    }

    #[test]
    fn trailing_partial_batch_is_dropped() {
        let windows: Vec<Window> = (0..7).map(|i| window(&[i, i], 0)).collect();
        let mut rng = MusicRng::new(5);
        let batches = shuffled_batches(&windows, 3, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.codes().dims2().unwrap() == (3, 2)));
    }

    #[test]
    fn shuffle_is_seeded() {
        let windows: Vec<Window> = (0..32).map(|i| window(&[i], i % 4)).collect();
        let first = |seed| {
            let mut rng = MusicRng::new(seed);
            let batches = shuffled_batches(&windows, 32, &mut rng, &Device::Cpu).unwrap();
            batches[0].codes().flatten_all().unwrap().to_vec1::<u32>().unwrap()
        };
        assert_eq!(first(11), first(11));
        assert_ne!(first(11), first(12));
    }

    #[test]
    fn ordered_batches_keep_order() {
        let windows: Vec<Window> = (0..4).map(|i| window(&[i], 0)).collect();
        let batches = ordered_batches(&windows, 2, &Device::Cpu).unwrap();
        let codes = batches[1].codes().flatten_all().unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(codes, vec![2, 3]);
    }
}
