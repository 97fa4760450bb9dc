// Moodweaver CLI entry point.
//
// Three subcommands cover the whole pipeline:
// - `train`: ingest a labeled MIDI directory, build the vocabulary and
//   windows, train, write a checkpoint, and report training-set metrics.
// - `evaluate`: score a checkpoint on a labeled MIDI directory using the
//   checkpoint's own vocabulary, window length, and objective.
// - `generate`: sample a piece for an emotion and write it to MIDI.
//
// Usage:
//   cargo run -p moodweaver_music -- train --midi-dir midis --labels labels.csv --out model
//   cargo run -p moodweaver_music -- evaluate --checkpoint model --midi-dir midis --labels labels.csv
//   cargo run -p moodweaver_music -- generate --checkpoint model --emotion HVHA --out piece.mid
//
// Every command accepts `--config path.json` (see config.rs); flags given on
// the command line override the file. Log verbosity follows `RUST_LOG`
// (default `info`).

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use moodweaver_music::batch::ordered_batches;
use moodweaver_music::checkpoint::{self, Manifest};
use moodweaver_music::config::MusicConfig;
use moodweaver_music::corpus::{
    EmotionLabel, LabelTable, LabeledSource, ingest_directory, prepare_corpus,
};
use moodweaver_music::generate::{Generator, MemoryPolicy};
use moodweaver_music::midi::write_tokens;
use moodweaver_music::model::EmotionModel;
use moodweaver_music::train::{FitOptions, Trainer, evaluate};
use moodweaver_music::window::build_windows;
use moodweaver_prng::MusicRng;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "moodweaver", about = "Emotion-conditioned melody generation")]
struct Cli {
    /// JSON pipeline configuration. Missing fields use their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model on a labeled MIDI corpus and save a checkpoint.
    Train(TrainArgs),
    /// Score a checkpoint on a labeled MIDI corpus.
    Evaluate(EvaluateArgs),
    /// Sample a new piece and write it as MIDI.
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct CorpusArgs {
    /// Directory of `.mid` files named by their label-table id.
    #[arg(long)]
    midi_dir: PathBuf,
    /// CSV label table with an `ID` column.
    #[arg(long)]
    labels: PathBuf,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    corpus: CorpusArgs,
    /// Checkpoint stem; writes `<out>.safetensors` and `<out>.json`.
    #[arg(long, default_value = "moodweaver")]
    out: PathBuf,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[command(flatten)]
    corpus: CorpusArgs,
    /// Checkpoint stem written by `train`.
    #[arg(long)]
    checkpoint: PathBuf,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Checkpoint stem written by `train`.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Quadrant name (HVHA, HVLA, LVHA, LVLA) or zero-based index.
    #[arg(long)]
    emotion: Option<String>,
    #[arg(long)]
    length: Option<usize>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum)]
    memory: Option<MemoryArg>,
    #[arg(long)]
    tempo: Option<u16>,
    #[arg(long, default_value = "output.mid")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MemoryArg {
    Stateless,
    Carried,
}

impl From<MemoryArg> for MemoryPolicy {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Stateless => MemoryPolicy::Stateless,
            MemoryArg::Carried => MemoryPolicy::Carried,
        }
    }
}

fn main() -> Result<()> {
    setup_tracing()?;
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => MusicConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MusicConfig::default(),
    };

    match cli.command {
        Command::Train(args) => {
            if let Some(epochs) = args.epochs {
                config.training.epochs = epochs;
            }
            if args.seed.is_some() {
                config.training.seed = args.seed;
            }
            config.validate()?;
            run_train(&config, &args)
        }
        Command::Evaluate(args) => {
            config.validate()?;
            run_evaluate(&config, &args)
        }
        Command::Generate(args) => {
            let generation = &mut config.generation;
            if let Some(length) = args.length {
                generation.length = length;
            }
            if let Some(temperature) = args.temperature {
                generation.temperature = temperature;
            }
            if args.seed.is_some() {
                generation.seed = args.seed;
            }
            if let Some(memory) = args.memory {
                generation.memory = memory.into();
            }
            if let Some(tempo) = args.tempo {
                generation.tempo_bpm = tempo;
            }
            if let Some(raw) = &args.emotion {
                generation.emotion = EmotionLabel::parse(raw, config.corpus.num_emotions)?.index();
            }
            config.validate()?;
            run_generate(&config, &args)
        }
    }
}

fn setup_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialise tracing: {err}"))?;
    Ok(())
}

fn load_corpus(config: &MusicConfig, args: &CorpusArgs) -> Result<Vec<LabeledSource>> {
    let labels = LabelTable::load(
        &args.labels,
        &config.corpus.label_column,
        config.corpus.num_emotions,
    )
    .with_context(|| format!("reading label table {}", args.labels.display()))?;
    let sources = ingest_directory(&args.midi_dir, &labels)
        .with_context(|| format!("reading MIDI directory {}", args.midi_dir.display()))?;
    if sources.is_empty() {
        bail!("no labeled MIDI files found in {}", args.midi_dir.display());
    }
    Ok(sources)
}

/// Seeded RNG, or a clock-seeded one whose seed is logged for replay.
fn rng_for(seed: Option<u64>, purpose: &str) -> MusicRng {
    match seed {
        Some(seed) => MusicRng::new(seed),
        None => {
            let (rng, seed) = MusicRng::from_clock();
            info!(seed, purpose, "no seed given, seeded from clock");
            rng
        }
    }
}

fn run_train(config: &MusicConfig, args: &TrainArgs) -> Result<()> {
    let device = config.device()?;
    let sources = load_corpus(config, &args.corpus)?;
    let (vocab, filtered) = prepare_corpus(&sources, config.corpus.rarity_threshold);
    if vocab.is_empty() {
        bail!(
            "no token reaches the rarity threshold of {}",
            config.corpus.rarity_threshold
        );
    }
    let windows = build_windows(&filtered, &vocab, config.corpus.window_length)?;
    info!(
        windows = windows.len(),
        skipped = windows.skipped,
        window_length = windows.window_length,
        "cut training windows"
    );

    let model_config = config.model_config(vocab.len());
    let model = EmotionModel::new(model_config.clone(), &device)?;
    let training = &config.training;
    let mut trainer = Trainer::new(model, training.learning_rate, training.objective)?;
    let mut rng = rng_for(training.seed, "shuffling");
    let options = FitOptions {
        epochs: training.epochs,
        batch_size: training.batch_size,
    };
    trainer.fit(&windows.windows, &options, &mut rng, |_| ControlFlow::Continue(()))?;
    let model = trainer.into_model();

    let manifest = Manifest::new(
        model_config,
        vocab,
        config.corpus.window_length,
        training.objective,
    );
    checkpoint::save(&model, &manifest, &args.out)?;

    let batches = ordered_batches(&windows.windows, training.batch_size, model.device())?;
    evaluate(&model, &batches, training.objective)?;
    Ok(())
}

fn run_evaluate(config: &MusicConfig, args: &EvaluateArgs) -> Result<()> {
    let device = config.device()?;
    let (model, manifest) = load_checkpoint(&args.checkpoint, &device)?;
    if manifest.model.num_emotions != config.corpus.num_emotions {
        warn!(
            checkpoint = manifest.model.num_emotions,
            config = config.corpus.num_emotions,
            "emotion count differs from the checkpoint; labels are validated against the config"
        );
    }
    let sources = load_corpus(config, &args.corpus)?;
    let filtered: Vec<LabeledSource> = sources
        .into_iter()
        .map(|s| LabeledSource {
            tokens: manifest.vocabulary.retain_known(&s.tokens),
            ..s
        })
        .collect();
    let windows = build_windows(&filtered, &manifest.vocabulary, manifest.window_length)?;
    if windows.len() < config.training.batch_size {
        bail!(
            "{} windows cannot fill a batch of {}",
            windows.len(),
            config.training.batch_size
        );
    }
    let batches = ordered_batches(&windows.windows, config.training.batch_size, model.device())?;
    let evaluation = evaluate(&model, &batches, manifest.objective)?;
    println!(
        "loss {:.4}, accuracy {:.2}% over {} positions",
        evaluation.loss,
        evaluation.accuracy * 100.0,
        evaluation.positions
    );
    Ok(())
}

fn run_generate(config: &MusicConfig, args: &GenerateArgs) -> Result<()> {
    let device = config.device()?;
    let (model, manifest) = load_checkpoint(&args.checkpoint, &device)?;
    let generation = &config.generation;
    let emotion = EmotionLabel::new(generation.emotion);
    let generator = Generator::new(&model, &manifest.vocabulary)?.with_memory(generation.memory);
    let mut rng = rng_for(generation.seed, "generation");
    let tokens = generator.generate(emotion, generation.length, generation.temperature, &mut rng)?;
    write_tokens(&tokens, &args.out, generation.tempo_bpm)
        .with_context(|| format!("writing {}", args.out.display()))?;
    info!(
        tokens = tokens.len(),
        %emotion,
        out = %args.out.display(),
        "wrote generated piece"
    );
    Ok(())
}

fn load_checkpoint(stem: &Path, device: &candle_core::Device) -> Result<(EmotionModel, Manifest)> {
    checkpoint::load(stem, device).with_context(|| format!("loading checkpoint {}", stem.display()))
}
