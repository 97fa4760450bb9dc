// Checkpoint persistence.
//
// A checkpoint is two files sharing a stem:
// - `<stem>.safetensors`: the model's learned parameters and nothing else.
// - `<stem>.json`: the manifest, holding everything the parameters cannot be
//   interpreted without: the frozen vocabulary (code order matters) and the
//   `ModelConfig` the parameter shapes were created from. Training-side
//   settings that affect how the model should be used (window length,
//   objective) ride along for reference.
//
// Loading rebuilds an `EmotionModel` from the manifest's config and then
// overwrites its parameters from the safetensors file; any disagreement in
// names or shapes is a tensor error. The manifest is checked for internal
// consistency (vocabulary size equals the model's output dimension) before
// anything is allocated.

use crate::error::{MusicError, Result};
use crate::model::{EmotionModel, ModelConfig};
use crate::train::Objective;
use crate::vocab::Vocabulary;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Bumped when the manifest layout changes incompatibly.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub model: ModelConfig,
    pub vocabulary: Vocabulary,
    pub window_length: usize,
    pub objective: Objective,
}

impl Manifest {
    pub fn new(
        model: ModelConfig,
        vocabulary: Vocabulary,
        window_length: usize,
        objective: Objective,
    ) -> Self {
        Manifest {
            version: MANIFEST_VERSION,
            model,
            vocabulary,
            window_length,
            objective,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(MusicError::Config(format!(
                "manifest version {} is not supported (expected {MANIFEST_VERSION})",
                self.version
            )));
        }
        if self.vocabulary.len() != self.model.vocab_size {
            return Err(MusicError::VocabularyMismatch {
                vocabulary: self.vocabulary.len(),
                model: self.model.vocab_size,
            });
        }
        self.model.validate()
    }
}

/// `(parameters, manifest)` paths for a checkpoint stem.
///
/// Suffixes are appended to the whole stem, so dots inside it (`lr0.001`)
/// are kept.
pub fn checkpoint_paths(stem: &Path) -> (PathBuf, PathBuf) {
    (with_suffix(stem, ".safetensors"), with_suffix(stem, ".json"))
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut path = stem.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Write parameters and manifest next to each other.
pub fn save(model: &EmotionModel, manifest: &Manifest, stem: &Path) -> Result<()> {
    if model.config() != &manifest.model {
        return Err(MusicError::Config(
            "manifest model config differs from the model being saved".into(),
        ));
    }
    manifest.validate()?;
    let (params_path, manifest_path) = checkpoint_paths(stem);
    if let Some(parent) = params_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    model.save_parameters(&params_path)?;
    std::fs::write(&manifest_path, serde_json::to_string_pretty(manifest)?)?;
    info!(
        parameters = %params_path.display(),
        manifest = %manifest_path.display(),
        "saved checkpoint"
    );
    Ok(())
}

pub fn load_manifest(stem: &Path) -> Result<Manifest> {
    let (_, manifest_path) = checkpoint_paths(stem);
    let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;
    manifest.validate()?;
    Ok(manifest)
}

/// Rebuild the model described by the manifest and load its parameters.
pub fn load(stem: &Path, device: &Device) -> Result<(EmotionModel, Manifest)> {
    let manifest = load_manifest(stem)?;
    let (params_path, _) = checkpoint_paths(stem);
    let mut model = EmotionModel::new(manifest.model.clone(), device)?;
    model.load_parameters(&params_path)?;
    info!(
        checkpoint = %params_path.display(),
        vocab_size = manifest.vocabulary.len(),
        "loaded checkpoint"
    );
    Ok((model, manifest))
}
