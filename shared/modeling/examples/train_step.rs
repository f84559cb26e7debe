//! Trains the small reference model on a synthetic reversal task with source
//! corruption and the consistency-regularized loss.
//!
//! Usage:
//!   cargo run --example train_step -- --add-noise --noise-rate 0.15 --noise-type swap --is-half-batch

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng, rngs::StdRng};
use robustmt_core::{
    CriterionArgs, Dictionary, InfeasiblePolicy, KlDirection, LoggingRecord, Meters, NllSubset,
    NoiseArgs, NoiseInjector, NoiseType, TokenBatch, Vocabulary, reduce_metrics,
};
use robustmt_modeling::{
    DummyTranslationModel, RobustCriterion, RobustTrainer, Sample, TrainerConfig,
    metrics::{MetricsConfig, MetricsRecorder},
};
use std::{path::PathBuf, sync::Arc};
use tch::Device;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
struct Args {
    #[arg(long, default_value_t = 20)]
    steps: u64,

    #[arg(long, default_value_t = 64)]
    vocab_size: usize,

    #[arg(long, default_value_t = 32)]
    embed_dim: i64,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    #[arg(long, default_value_t = 10)]
    max_len: usize,

    #[arg(long, default_value_t = 5e-3)]
    learning_rate: f64,

    #[arg(long)]
    clip_norm: Option<f64>,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long)]
    add_noise: bool,

    #[arg(long, default_value_t = 0.0)]
    noise_rate: f64,

    /// replace, remove, swap, insert or hybrid
    #[arg(long, default_value = "replace")]
    noise_type: NoiseType,

    /// Corrupt only the leading half of each batch
    #[arg(long)]
    is_half_batch: bool,

    #[arg(long)]
    curriculum_learning: bool,

    /// JSON, e.g. {"max_rate":0.3,"mupdates":100,"cupdates":10,"p":2,"type":1}
    #[arg(long)]
    curriculum_args: Option<String>,

    #[arg(long, default_value = "skip")]
    on_infeasible: InfeasiblePolicy,

    #[arg(long, default_value_t = 0.1)]
    label_smoothing: f64,

    #[arg(long, default_value_t = 1.5)]
    reg_alpha: f64,

    #[arg(long, default_value = "both")]
    kl_direction: KlDirection,

    #[arg(long, default_value = "both")]
    only_nll: NllSubset,

    #[arg(long, default_value_t = 0)]
    ignore_prefix_size: usize,

    #[arg(long)]
    sentence_avg: bool,

    #[arg(long)]
    report_accuracy: bool,

    /// Write per-step metrics to this JSONL file
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

impl Args {
    fn noise_args(&self) -> NoiseArgs {
        NoiseArgs {
            add_noise: self.add_noise,
            noise_rate: self.noise_rate,
            noise_type: self.noise_type,
            is_half_batch: self.is_half_batch,
            curriculum_learning: self.curriculum_learning,
            curriculum_args: self.curriculum_args.clone(),
            noise_seed: Some(self.seed),
            on_infeasible: self.on_infeasible,
        }
    }

    fn criterion_args(&self) -> CriterionArgs {
        CriterionArgs {
            label_smoothing: self.label_smoothing,
            reg_alpha: self.reg_alpha,
            kl_direction: self.kl_direction,
            only_nll: self.only_nll,
            ignore_prefix_size: self.ignore_prefix_size,
            sentence_avg: self.sentence_avg,
            report_accuracy: self.report_accuracy,
        }
    }
}

/// Random source sentences and their reversal as targets.
fn synthetic_sample(args: &Args, vocab: &Vocabulary, rng: &mut StdRng) -> Result<Sample> {
    let (sources, targets): (Vec<Vec<i64>>, Vec<Vec<i64>>) = (0..args.batch_size)
        .map(|_| {
            let len = rng.random_range(2..=args.max_len.max(2));
            let mut source: Vec<i64> = (0..len)
                .map(|_| rng.random_range(4..vocab.len() as i64))
                .collect();
            let mut target: Vec<i64> = source.iter().rev().copied().collect();
            source.push(vocab.eos());
            target.push(vocab.eos());
            (source, target)
        })
        .unzip();
    let source = TokenBatch::left_padded(&sources, vocab.pad());
    let target = TokenBatch::right_padded(&targets, vocab.pad());
    Sample::new(&source, &target, vocab, Device::cuda_if_available())
        .context("failed to build synthetic sample")
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).context("invalid log filter")?)
        .init();
    tch::manual_seed(args.seed as i64);

    let noise = args
        .noise_args()
        .resolve()
        .context("invalid noise configuration")?;
    info!(
        enabled = noise.enabled,
        operator = %noise.operator,
        rate = noise.base_rate,
        curriculum = noise.curriculum.is_some(),
        "source corruption"
    );

    let vocab = Arc::new(Vocabulary::synthetic(args.vocab_size));
    let model = DummyTranslationModel::new(
        vocab.clone(),
        NoiseInjector::new(noise),
        args.embed_dim,
        Device::cuda_if_available(),
    );
    let criterion = RobustCriterion::new(args.criterion_args(), vocab.pad())
        .context("invalid criterion configuration")?;
    let mut trainer = RobustTrainer::new(
        model,
        criterion,
        TrainerConfig {
            learning_rate: args.learning_rate,
            clip_norm: args.clip_norm,
        },
    )?;
    let mut recorder = match &args.metrics_output {
        Some(path) => MetricsRecorder::new(MetricsConfig::enabled(path))?,
        None => MetricsRecorder::disabled(),
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let sample = synthetic_sample(&args, &vocab, &mut rng)?;
    let mut records: Vec<LoggingRecord> = Vec::with_capacity(args.steps as usize);
    for _ in 0..args.steps {
        let output = trainer.train_step(&sample)?;
        recorder.record_step(&output)?;
        info!(
            step = output.num_updates,
            loss = output.record.loss,
            nll_loss = output.record.nll_loss,
            kl_loss = output.record.kl_loss,
            noise_rate = output.noise_rate,
            "trained"
        );
        records.push(output.record);
    }

    let mut meters = Meters::new();
    reduce_metrics(&records, &mut meters);
    for (name, value) in meters.smoothed_values() {
        info!(metric = %name, value, "train");
    }

    let valid = trainer.valid_step(&sample)?;
    let mut valid_meters = Meters::new();
    reduce_metrics(&[valid], &mut valid_meters);
    for (name, value) in valid_meters.smoothed_values() {
        info!(metric = %name, value, "valid");
    }
    if recorder.is_enabled() {
        info!(
            steps = recorder.steps_recorded(),
            path = %recorder.output_path().display(),
            "wrote metrics"
        );
    }

    Ok(())
}
