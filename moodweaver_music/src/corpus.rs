// Corpus ingestion: labeled token streams.
//
// The training pipeline consumes `LabeledSource`s: one per input file, each
// carrying the file's canonical token stream and its single emotion label.
// Labels come from a side table (CSV, one row per file id) and are joined to
// files by id exactly once, here. Files without a row are skipped with a
// warning rather than failing the run; so are files midly cannot parse.
//
// Emotion labels are zero-based indices `0..E-1`. The EMOPIA-style label
// table stores Russell-quadrant labels 1..=4 (HVHA, HVLA, LVHA, LVLA), so the
// 1-based → 0-based shift is part of parsing and is validated against `E`.
//
// `prepare_corpus` is the front half of training: count tokens across all
// sources, freeze the vocabulary, and strip rare tokens from every source.

use crate::error::{MusicError, Result};
use crate::midi::read_midi_tokens;
use crate::token::Token;
use crate::vocab::{TokenCounts, Vocabulary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Quadrant names of the four-class arousal/valence scheme, by zero-based index.
pub const QUADRANT_NAMES: [&str; 4] = ["HVHA", "HVLA", "LVHA", "LVLA"];

/// Default label column in the label table.
pub const DEFAULT_LABEL_COLUMN: &str = "4Q";

/// Zero-based emotion class index.
///
/// Construction does not know how many classes the model has; consumers call
/// `validate` (the model does so before touching any tensor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionLabel(u32);

impl EmotionLabel {
    pub const fn new(index: u32) -> Self {
        EmotionLabel(index)
    }

    /// Normalize a 1-based table label into `0..num_emotions`.
    pub fn from_one_based(raw: i64, num_emotions: usize) -> Result<Self> {
        if raw < 1 || raw > num_emotions as i64 {
            return Err(MusicError::InvalidLabel {
                raw: raw.to_string(),
                reason: format!("1-based labels must lie in 1..={num_emotions}"),
            });
        }
        Ok(EmotionLabel((raw - 1) as u32))
    }

    /// Parse a user-facing label: a quadrant name (`HVLA`) or a zero-based index.
    pub fn parse(raw: &str, num_emotions: usize) -> Result<Self> {
        let trimmed = raw.trim();
        let label = if let Some(i) = QUADRANT_NAMES
            .iter()
            .position(|q| q.eq_ignore_ascii_case(trimmed))
        {
            EmotionLabel(i as u32)
        } else {
            let index = trimmed.parse::<u32>().map_err(|_| MusicError::InvalidLabel {
                raw: raw.to_string(),
                reason: "expected a quadrant name or a zero-based index".into(),
            })?;
            EmotionLabel(index)
        };
        label.validate(num_emotions)?;
        Ok(label)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub fn validate(self, num_emotions: usize) -> Result<()> {
        if (self.0 as usize) < num_emotions {
            Ok(())
        } else {
            Err(MusicError::EmotionOutOfRange {
                label: self.0,
                num_emotions,
            })
        }
    }

    pub fn quadrant_name(self) -> Option<&'static str> {
        QUADRANT_NAMES.get(self.0 as usize).copied()
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quadrant_name() {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// One input file's tokens and label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabeledSource {
    pub id: String,
    pub tokens: Vec<Token>,
    pub emotion: EmotionLabel,
}

/// File id → zero-based emotion label.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelTable {
    labels: BTreeMap<String, EmotionLabel>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, label: EmotionLabel) {
        self.labels.insert(id.into(), label);
    }

    pub fn get(&self, id: &str) -> Option<EmotionLabel> {
        self.labels.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Parse a comma-separated table with a header row containing `ID` and
    /// `label_column`. Label values are 1-based. Fields may be double-quoted
    /// to hold commas; records may not span lines.
    pub fn parse_csv(text: &str, label_column: &str, num_emotions: usize) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| MusicError::Config("label table is empty".into()))?;
        let columns = split_record(header);
        let find = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| MusicError::Config(format!("label table has no {name:?} column")))
        };
        let id_col = find("ID")?;
        let label_col = find(label_column)?;

        let mut table = LabelTable::new();
        for (row, line) in lines.enumerate() {
            let fields = split_record(line);
            let (Some(id), Some(raw)) = (fields.get(id_col), fields.get(label_col)) else {
                return Err(MusicError::Config(format!(
                    "label table row {} has {} fields, expected at least {}",
                    row + 2,
                    fields.len(),
                    id_col.max(label_col) + 1
                )));
            };
            let value: i64 = raw.parse().map_err(|_| MusicError::InvalidLabel {
                raw: raw.to_string(),
                reason: format!("row {} is not an integer", row + 2),
            })?;
            table.insert(id.as_str(), EmotionLabel::from_one_based(value, num_emotions)?);
        }
        Ok(table)
    }

    pub fn load(path: &Path, label_column: &str, num_emotions: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_csv(&text, label_column, num_emotions)
    }
}

/// Fields of one CSV record. Quotes group commas into a field and `""`
/// inside quotes is a literal quote. Surrounding whitespace is trimmed.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

/// Read every labeled `.mid`/`.midi` file in `dir`, sorted by file id.
pub fn ingest_directory(dir: &Path, labels: &LabelTable) -> Result<Vec<LabeledSource>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("mid") || e.eq_ignore_ascii_case("midi"))
        })
        .collect();
    paths.sort();

    let mut sources = Vec::new();
    for path in paths {
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        let Some(emotion) = labels.get(&id) else {
            warn!(file = %path.display(), "no label found, skipping file");
            continue;
        };
        match read_midi_tokens(&path) {
            Ok(tokens) => {
                debug!(source = %id, tokens = tokens.len(), "parsed MIDI file");
                sources.push(LabeledSource { id, tokens, emotion });
            }
            Err(e) => warn!(file = %path.display(), error = %e, "unreadable MIDI file, skipping"),
        }
    }
    info!(sources = sources.len(), "loaded labeled MIDI files");
    Ok(sources)
}

/// Count tokens over every source, freeze the vocabulary, and strip rare
/// tokens from each source. Sources may end up empty.
pub fn prepare_corpus(
    sources: &[LabeledSource],
    rarity_threshold: usize,
) -> (Vocabulary, Vec<LabeledSource>) {
    let mut counts = TokenCounts::new();
    for source in sources {
        counts.add_all(&source.tokens);
    }
    let vocab = Vocabulary::from_counts(&counts, rarity_threshold);
    let filtered: Vec<LabeledSource> = sources
        .iter()
        .map(|s| LabeledSource {
            id: s.id.clone(),
            tokens: vocab.retain_known(&s.tokens),
            emotion: s.emotion,
        })
        .collect();
    let kept: usize = filtered.iter().map(|s| s.tokens.len()).sum();
    info!(
        total = counts.total(),
        distinct = counts.distinct(),
        kept,
        vocab_size = vocab.len(),
        rarity_threshold,
        "built vocabulary"
    );
    (vocab, filtered)
}
