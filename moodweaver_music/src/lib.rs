// Moodweaver: emotion-conditioned melody generation
//
// Learns a next-token model over symbolic music (note and chord tokens
// extracted from MIDI) conditioned on one of four emotion classes, then
// samples new pieces for a requested emotion. The model is a two-layer LSTM
// whose input at every step is the token embedding concatenated with the
// piece's emotion embedding.
//
// Architecture:
// - token.rs: Note/chord token text form and its MIDI pitch mapping
// - midi.rs: MIDI file parsing into tokens and token rendering back to MIDI
// - corpus.rs: Emotion labels, the label table, directory ingestion, and
//   rare-token filtering of the labeled corpus
// - vocab.rs: Token frequency counts and the frozen token <-> code mapping
// - window.rs: Fixed-length training windows cut from coded sequences
// - batch.rs: Dense (B, L) code tensors plus per-window emotion labels
// - model.rs: Embeddings + stacked LSTM + output projection (candle)
// - train.rs: Adam training loop, objectives, and evaluation
// - generate.rs: Temperature sampling and autoregressive generation
// - checkpoint.rs: Parameters (safetensors) plus JSON manifest on disk
// - config.rs: JSON pipeline configuration with defaults
// - error.rs: Crate-wide error type
//
// Randomness outside dropout comes from `moodweaver_prng`, so shuffling and
// generation are reproducible given a seed.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod error;
pub mod generate;
pub mod midi;
pub mod model;
pub mod token;
pub mod train;
pub mod vocab;
pub mod window;
