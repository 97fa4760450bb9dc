// Token vocabulary with rarity filtering.
//
// Tokens whose global occurrence count falls below a threshold are dropped
// from the corpus (the survivors close up, keeping their order), and the
// distinct survivors are numbered `0..V-1` in lexicographic token order.
// Sorting makes the mapping a pure function of the filtered corpus: building
// twice from the same input always yields the same codes.
//
// The vocabulary is frozen once built. A trained model's output layer is
// indexed by these codes, so the exact vocabulary must travel with the
// checkpoint (see checkpoint.rs) and be handed explicitly to the windower and
// the generator. Only the code → token direction is serialized; the lookup
// index is rebuilt on load.

use crate::token::Token;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default rarity threshold: tokens seen fewer times are discarded.
pub const DEFAULT_RARITY_THRESHOLD: usize = 100;

/// Global occurrence counts over one or more token streams.
#[derive(Clone, Debug, Default)]
pub struct TokenCounts {
    counts: FxHashMap<Token, usize>,
}

impl TokenCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> Self {
        let mut counts = Self::new();
        counts.add_all(tokens);
        counts
    }

    pub fn add_all<'a>(&mut self, tokens: impl IntoIterator<Item = &'a Token>) {
        for token in tokens {
            *self.counts.entry(token.clone()).or_insert(0) += 1;
        }
    }

    pub fn get(&self, token: &Token) -> usize {
        self.counts.get(token).copied().unwrap_or(0)
    }

    /// Number of distinct tokens seen.
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    /// Total number of tokens seen.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Distinct tokens with count `>= threshold`, sorted.
    pub fn retained(&self, threshold: usize) -> Vec<Token> {
        let mut kept: Vec<Token> = self
            .counts
            .iter()
            .filter(|&(_, &n)| n >= threshold)
            .map(|(t, _)| t.clone())
            .collect();
        kept.sort();
        kept
    }
}

/// Bijective token ↔ code mapping over `0..len()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Token>", into = "Vec<Token>")]
pub struct Vocabulary {
    tokens: Vec<Token>,
    codes: BTreeMap<Token, u32>,
}

impl Vocabulary {
    /// Filter `corpus` by `threshold` and number the survivors.
    ///
    /// Returns the vocabulary together with the filtered corpus.
    pub fn build(corpus: &[Token], threshold: usize) -> (Self, Vec<Token>) {
        let counts = TokenCounts::from_tokens(corpus);
        let vocab = Self::from_counts(&counts, threshold);
        let filtered = vocab.retain_known(corpus);
        (vocab, filtered)
    }

    /// Vocabulary of every token in `counts` reaching `threshold`.
    pub fn from_counts(counts: &TokenCounts, threshold: usize) -> Self {
        Self::from_sorted_unique(counts.retained(threshold))
    }

    fn from_sorted_unique(tokens: Vec<Token>) -> Self {
        let codes = tokens
            .iter()
            .enumerate()
            .map(|(code, token)| (token.clone(), code as u32))
            .collect();
        Vocabulary { tokens, codes }
    }

    pub fn code(&self, token: &Token) -> Option<u32> {
        self.codes.get(token).copied()
    }

    /// Reverse mapping, code → token.
    pub fn token(&self, code: u32) -> Option<&Token> {
        self.tokens.get(code as usize)
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.codes.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// All tokens in code order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Order-preserving copy of `tokens` without anything outside the vocabulary.
    pub fn retain_known(&self, tokens: &[Token]) -> Vec<Token> {
        tokens.iter().filter(|t| self.contains(t)).cloned().collect()
    }
}

impl TryFrom<Vec<Token>> for Vocabulary {
    type Error = String;

    fn try_from(tokens: Vec<Token>) -> Result<Self, Self::Error> {
        if let Some(pair) = tokens.windows(2).find(|w| w[0] >= w[1]) {
            return Err(format!(
                "vocabulary tokens must be strictly sorted, found {:?} before {:?}",
                pair[0].as_str(),
                pair[1].as_str()
            ));
        }
        Ok(Self::from_sorted_unique(tokens))
    }
}

impl From<Vocabulary> for Vec<Token> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.tokens
    }
}
