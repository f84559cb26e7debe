use std::sync::Arc;

use robustmt_core::{
    ConfigError, CriterionArgs, Dictionary, KlDirection, LoggingRecord, Meters, NllSubset,
    NoiseArgs, NoiseInjector, NoiseLayout, NoiseType, TokenBatch, Vocabulary, reduce_metrics,
};
use robustmt_modeling::{
    CriterionError, DummyTranslationModel, LoggingOutput, ModelError, NetInput, NetOutput,
    RobustCriterion, RobustTrainer, Sample, TrainerConfig, TranslationModel,
};
use tch::{Device, nn};

const VOCAB: usize = 24;

fn vocab() -> Arc<Vocabulary> {
    Arc::new(Vocabulary::synthetic(VOCAB))
}

fn injector(noise_rate: f64, half: bool) -> NoiseInjector {
    let config = NoiseArgs {
        add_noise: true,
        noise_rate,
        noise_type: NoiseType::Replace,
        is_half_batch: half,
        noise_seed: Some(11),
        ..Default::default()
    }
    .resolve()
    .unwrap();
    NoiseInjector::new(config)
}

fn model(vocab: &Arc<Vocabulary>, injector: NoiseInjector) -> DummyTranslationModel {
    tch::manual_seed(7);
    DummyTranslationModel::new(vocab.clone(), injector, 16, Device::Cpu)
}

fn sample(vocab: &Vocabulary, source: &[Vec<i64>], target: &[Vec<i64>]) -> Sample {
    let source = TokenBatch::right_padded(source, vocab.pad());
    let target = TokenBatch::right_padded(target, vocab.pad());
    Sample::new(&source, &target, vocab, Device::Cpu).unwrap()
}

fn two_sentences(vocab: &Vocabulary) -> Sample {
    sample(
        vocab,
        &[vec![4, 5, 6, 7, 2], vec![8, 9, 10, 11, 2]],
        &[vec![12, 13, 14, 15, 2], vec![16, 17, 18, 2]],
    )
}

fn criterion(args: CriterionArgs) -> RobustCriterion {
    RobustCriterion::new(args, 1).unwrap()
}

fn reduced(output: &LoggingOutput) -> LoggingRecord {
    *output.record().expect("reduced record")
}

#[test]
fn test_end_to_end_replace_noise() {
    let vocab = vocab();
    let model = model(&vocab, injector(0.5, true));
    let sample = two_sentences(&vocab);
    let criterion = criterion(CriterionArgs {
        label_smoothing: 0.1,
        kl_direction: KlDirection::Both,
        only_nll: NllSubset::Both,
        ..Default::default()
    });

    let output = criterion.forward(&model, &sample, true).unwrap();
    let record = reduced(&output.logging);

    assert!(output.loss.double_value(&[]).is_finite());
    assert!(record.loss.is_finite());
    assert!(record.nll_loss >= 0.0);
    assert!(record.kl_loss >= 0.0);
    assert_eq!(record.ntokens, 9);
    assert_eq!(record.sample_size, record.ntokens);
    assert_eq!(output.sample_size, 9);
    assert_eq!(record.nsentences, 2);
    assert_eq!(output.noise_rate, Some(0.5));
    // corrupted sources give the two halves different predictions
    assert!(record.kl_loss > 0.0);
}

#[test]
fn test_clean_pass_has_no_consistency_loss() {
    let vocab = vocab();
    let model = model(&vocab, injector(0.5, true));
    model.set_training(false);
    let sample = two_sentences(&vocab);

    let output = criterion(CriterionArgs::default())
        .forward(&model, &sample, true)
        .unwrap();
    let record = reduced(&output.logging);
    assert!(record.kl_loss.abs() < 1e-5, "kl = {}", record.kl_loss);
    assert!(output.noise_rate.is_none());
    assert!((record.loss - record.nll_loss).abs() < 1e-4);
}

#[test]
fn test_records_of_split_batches_sum_to_union() {
    let vocab = vocab();
    let model = model(&vocab, NoiseInjector::disabled());
    let criterion = criterion(CriterionArgs {
        label_smoothing: 0.1,
        ..Default::default()
    });

    let src_a = [vec![4, 5, 6, 7, 2], vec![8, 9, 2]];
    let tgt_a = [vec![12, 13, 14, 15, 2], vec![16, 2]];
    let src_b = [vec![10, 11, 12, 13, 2], vec![14, 2]];
    let tgt_b = [vec![17, 18, 19, 20, 2], vec![21, 22, 2]];
    let union_src: Vec<Vec<i64>> = src_a.iter().chain(&src_b).cloned().collect();
    let union_tgt: Vec<Vec<i64>> = tgt_a.iter().chain(&tgt_b).cloned().collect();

    let a = reduced(&criterion.forward(&model, &sample(&vocab, &src_a, &tgt_a), true).unwrap().logging);
    let b = reduced(&criterion.forward(&model, &sample(&vocab, &src_b, &tgt_b), true).unwrap().logging);
    let union = reduced(
        &criterion
            .forward(&model, &sample(&vocab, &union_src, &union_tgt), true)
            .unwrap()
            .logging,
    );

    let summed = a + b;
    assert_eq!(summed.ntokens, union.ntokens);
    assert_eq!(summed.nsentences, union.nsentences);
    assert_eq!(summed.sample_size, union.sample_size);
    assert!((summed.loss - union.loss).abs() < 1e-3);
    assert!((summed.nll_loss - union.nll_loss).abs() < 1e-3);
    assert!((summed.kl_loss - union.kl_loss).abs() < 1e-4);

    let mut meters = Meters::new();
    reduce_metrics(&[a, b], &mut meters);
    let ppl = meters.value("ppl").unwrap();
    assert!(ppl >= 1.0 && ppl.is_finite());
}

#[test]
fn test_subset_requires_leading_half_layout() {
    let vocab = vocab();
    let full = model(&vocab, injector(0.3, false));
    assert_eq!(full.noise_layout(), NoiseLayout::Full);
    let sample = two_sentences(&vocab);

    for subset in [NllSubset::Clean, NllSubset::Noise] {
        let criterion = criterion(CriterionArgs {
            only_nll: subset,
            ..Default::default()
        });
        assert!(matches!(
            criterion.forward(&full, &sample, true),
            Err(CriterionError::Config(ConfigError::SubsetWithoutNoisedHalf { .. }))
        ));
    }

    let half = model(&vocab, injector(0.3, true));
    let clean_only = criterion(CriterionArgs {
        only_nll: NllSubset::Clean,
        report_accuracy: true,
        ..Default::default()
    });
    let record = reduced(&clean_only.forward(&half, &sample, true).unwrap().logging);
    // accuracy counts only the clean half
    assert_eq!(record.total, 9);
    assert!(record.n_correct <= record.total);
}

#[test]
fn test_accuracy_prefix_and_sentence_avg() {
    let vocab = vocab();
    let model = model(&vocab, NoiseInjector::disabled());
    let sample = two_sentences(&vocab);
    let criterion = criterion(CriterionArgs {
        report_accuracy: true,
        sentence_avg: true,
        ignore_prefix_size: 1,
        ..Default::default()
    });

    let output = criterion.forward(&model, &sample, true).unwrap();
    let record = reduced(&output.logging);
    // both halves, first target position dropped from each row
    assert_eq!(record.total, 2 * (9 - 2));
    assert_eq!(record.sample_size, 2);
    assert_eq!(output.sample_size, 2);
}

#[test]
fn test_unreduced_reports_positions() {
    let vocab = vocab();
    let model = model(&vocab, NoiseInjector::disabled());
    let sample = two_sentences(&vocab);
    let criterion = criterion(CriterionArgs::default());

    let reduced_loss = criterion
        .forward(&model, &sample, true)
        .unwrap()
        .loss
        .double_value(&[]);
    let output = criterion.forward(&model, &sample, false).unwrap();
    assert!((output.loss.double_value(&[]) - reduced_loss).abs() < 1e-4);

    let LoggingOutput::Unreduced(positions) = output.logging else {
        panic!("expected per-position losses");
    };
    // two copies of a 2 x 5 target
    assert_eq!(positions.nll_loss.size(), vec![20]);
    assert_eq!(positions.smoothed_loss.size(), vec![20]);
    assert_eq!(positions.kl_loss.size(), vec![2, 5]);
    assert_eq!(positions.ntokens, 9);
}

/// Returns a single copy of the batch, as a model that ignores doubling would.
struct UndoubledModel(DummyTranslationModel);

impl TranslationModel for UndoubledModel {
    fn forward(&self, net_input: &NetInput) -> Result<NetOutput, ModelError> {
        let mut output = self.0.forward(net_input)?;
        let rows = net_input.batch_size() / 2;
        output.logits = output.logits.narrow(0, 0, rows);
        Ok(output)
    }

    fn num_updates(&self) -> u64 {
        self.0.num_updates()
    }

    fn set_num_updates(&self, num_updates: u64) {
        self.0.set_num_updates(num_updates)
    }

    fn training(&self) -> bool {
        self.0.training()
    }

    fn set_training(&self, training: bool) {
        self.0.set_training(training)
    }

    fn noise_layout(&self) -> NoiseLayout {
        self.0.noise_layout()
    }

    fn device(&self) -> Device {
        self.0.device()
    }

    fn var_store(&self) -> &nn::VarStore {
        self.0.var_store()
    }
}

#[test]
fn test_shape_mismatch_is_reported() {
    let vocab = vocab();
    let broken = UndoubledModel(model(&vocab, NoiseInjector::disabled()));
    let sample = two_sentences(&vocab);
    assert!(matches!(
        criterion(CriterionArgs::default()).forward(&broken, &sample, true),
        Err(CriterionError::ShapeMismatch {
            what: "log-probabilities",
            ..
        })
    ));
}

#[test]
fn test_trainer_reduces_loss_and_counts_updates() {
    let vocab = vocab();
    let model = model(&vocab, NoiseInjector::disabled());
    let sample = two_sentences(&vocab);
    let mut trainer = RobustTrainer::new(
        model,
        criterion(CriterionArgs::default()),
        TrainerConfig {
            learning_rate: 1e-2,
            clip_norm: Some(1.0),
        },
    )
    .unwrap();

    let first = trainer.train_step(&sample).unwrap();
    assert_eq!(first.num_updates, 1);
    let mut last = first.clone();
    for _ in 0..40 {
        last = trainer.train_step(&sample).unwrap();
    }
    assert_eq!(trainer.num_updates(), 41);
    assert!(
        last.record.loss < first.record.loss,
        "{} !< {}",
        last.record.loss,
        first.record.loss
    );

    let valid = trainer.valid_step(&sample).unwrap();
    assert!(valid.kl_loss.abs() < 1e-5);
    assert!(trainer.model().training());
}

#[test]
fn test_curriculum_follows_model_updates() {
    let vocab = vocab();
    let config = NoiseArgs {
        add_noise: true,
        noise_type: NoiseType::Swap,
        is_half_batch: true,
        curriculum_learning: true,
        curriculum_args: Some(
            r#"{"max_rate": 0.5, "mupdates": 10, "cupdates": 1, "p": 1.0, "type": 2}"#.to_string(),
        ),
        noise_seed: Some(3),
        ..Default::default()
    }
    .resolve()
    .unwrap();
    let model = model(&vocab, NoiseInjector::new(config));
    let sample = two_sentences(&vocab);
    let criterion = criterion(CriterionArgs::default());

    let start = criterion.forward(&model, &sample, true).unwrap();
    assert_eq!(start.noise_rate, Some(0.0));

    model.set_num_updates(10);
    let end = criterion.forward(&model, &sample, true).unwrap();
    assert_eq!(end.noise_rate, Some(0.5));
    assert_eq!(model.encoder_input().ceiling().unwrap(), Some(0.5));
}

#[test]
fn test_noise_layout_matches_encoder_input() {
    let vocab = vocab();
    let model = model(&vocab, injector(0.2, true));
    assert_eq!(model.noise_layout(), model.encoder_input().layout());
    assert_eq!(model.encoder_input().dictionary().len(), VOCAB);

    // eval-mode forward leaves sources as they are
    model.set_training(false);
    let sample = two_sentences(&vocab);
    let out = model.forward(&sample.net_input).unwrap();
    assert!(out.noise_rate.is_none());
}
