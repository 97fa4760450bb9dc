// Fixed-length training windows.
//
// Each source's (already filtered) token stream is cut into consecutive,
// non-overlapping chunks of exactly `L` tokens; the trailing `N mod L`
// tokens are dropped, so a source yields `floor(N / L)` windows. Windows are
// cut per source and never straddle two files. Every window inherits its
// source's emotion label.
//
// Tokens are encoded through the frozen vocabulary. A chunk containing a
// token the vocabulary does not know is skipped whole and logged: it would
// otherwise need a substitute code, and a made-up code is a corrupted
// training example. This only happens when the vocabulary was built from a
// different slice of the corpus than the one being windowed.

use crate::corpus::{EmotionLabel, LabeledSource};
use crate::error::{MusicError, Result};
use crate::vocab::Vocabulary;
use tracing::{debug, warn};

/// Default window length in tokens.
pub const DEFAULT_WINDOW_LENGTH: usize = 50;

/// One training example: `L` vocabulary codes and their source's label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub codes: Vec<u32>,
    pub emotion: EmotionLabel,
}

/// All windows cut from a corpus, plus how many chunks were rejected.
#[derive(Clone, Debug, Default)]
pub struct WindowSet {
    pub windows: Vec<Window>,
    pub skipped: usize,
    pub window_length: usize,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Cut every source into windows of `window_length` codes.
pub fn build_windows(
    sources: &[LabeledSource],
    vocab: &Vocabulary,
    window_length: usize,
) -> Result<WindowSet> {
    if window_length == 0 {
        return Err(MusicError::Config("window length must be at least 1".into()));
    }
    let mut set = WindowSet {
        window_length,
        ..WindowSet::default()
    };
    for source in sources {
        let before = set.windows.len();
        for (i, chunk) in source.tokens.chunks_exact(window_length).enumerate() {
            let codes: Option<Vec<u32>> = chunk.iter().map(|t| vocab.code(t)).collect();
            match codes {
                Some(codes) => set.windows.push(Window {
                    codes,
                    emotion: source.emotion,
                }),
                None => {
                    let unknown = chunk.iter().find(|t| !vocab.contains(t));
                    warn!(
                        source = %source.id,
                        window = i,
                        token = unknown.map(|t| t.as_str()).unwrap_or("?"),
                        "token missing from vocabulary, skipping window"
                    );
                    set.skipped += 1;
                }
            }
        }
        debug!(
            source = %source.id,
            windows = set.windows.len() - before,
            tokens = source.tokens.len(),
            "windowed source"
        );
    }
    Ok(set)
}
