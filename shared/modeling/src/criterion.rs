//! Label-smoothed cross entropy with a KL consistency term between the clean
//! and the corrupted copy of every sentence.
//!
//! The criterion doubles the batch, runs the model once, and splits the
//! output: rows `[0, n)` went through source corruption (the model reports a
//! [`NoiseLayout::LeadingHalf`] layout), rows `[n, 2n)` did not.

use robustmt_core::{ConfigError, CriterionArgs, KlDirection, LoggingRecord, NllSubset, NoiseLayout};
use tch::{Kind, Tensor};
use thiserror::Error;
use tracing::debug;

use crate::{ModelError, NetOutput, Sample, TranslationModel};

#[derive(Error, Debug)]
pub enum CriterionError {
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Label-smoothed NLL over `(N, V)` log-probabilities and `(N,)` targets.
///
/// Returns `(loss, nll_loss)`, summed when `reduce` is set and per position
/// otherwise. Positions whose target equals `ignore_index` contribute zero.
pub fn label_smoothed_nll_loss(
    lprobs: &Tensor,
    target: &Tensor,
    epsilon: f64,
    ignore_index: Option<i64>,
    reduce: bool,
) -> (Tensor, Tensor) {
    let target = target.unsqueeze(-1);
    let mut nll_loss = -lprobs.gather(-1, &target, false);
    let mut smooth_loss = -lprobs.sum_dim_intlist(-1, true, Kind::Float);
    if let Some(ignore_index) = ignore_index {
        let pad_mask = target.eq(ignore_index);
        nll_loss = nll_loss.masked_fill(&pad_mask, 0.0);
        smooth_loss = smooth_loss.masked_fill(&pad_mask, 0.0);
    }
    let mut nll_loss = nll_loss.squeeze_dim(-1);
    let mut smooth_loss = smooth_loss.squeeze_dim(-1);
    if reduce {
        nll_loss = nll_loss.sum(Kind::Float);
        smooth_loss = smooth_loss.sum(Kind::Float);
    }
    let vocab = lprobs.size().last().copied().unwrap_or(1);
    let eps_i = if vocab > 1 {
        epsilon / (vocab - 1) as f64
    } else {
        0.0
    };
    let loss = &nll_loss * (1.0 - epsilon - eps_i) + &smooth_loss * eps_i;
    (loss, nll_loss)
}

/// `KL(target || input)` per position, from log-probabilities of both.
fn position_kl(input_lprobs: &Tensor, target_lprobs: &Tensor) -> Tensor {
    (target_lprobs.exp() * (target_lprobs - input_lprobs)).sum_dim_intlist(-1, false, Kind::Float)
}

/// Consistency term between the corrupted half and the clean half of
/// `(2n, T, V)` log-probabilities. `pad_mask` is the `(n, T)` target pad mask
/// and zeroes the divergence of padded positions.
///
/// - `Clean`: `KL(clean || noised)`
/// - `Noise`: `KL(noised || clean)`
/// - `Both`: the mean of the two.
///
/// Summed when `reduce` is set, `(n, T)` otherwise.
pub fn kl_consistency_loss(
    lprobs: &Tensor,
    pad_mask: &Tensor,
    direction: KlDirection,
    reduce: bool,
) -> Tensor {
    let half = lprobs.size()[0] / 2;
    let noised = lprobs.narrow(0, 0, half);
    let clean = lprobs.narrow(0, half, half);
    let masked = |kl: Tensor| kl.masked_fill(pad_mask, 0.0);
    let kl = match direction {
        KlDirection::Clean => masked(position_kl(&noised, &clean)),
        KlDirection::Noise => masked(position_kl(&clean, &noised)),
        KlDirection::Both => {
            (masked(position_kl(&noised, &clean)) + masked(position_kl(&clean, &noised))) / 2.0
        }
    };
    if reduce { kl.sum(Kind::Float) } else { kl }
}

/// Per-position components, reported instead of the scalar record when the
/// criterion runs unreduced.
#[derive(Debug)]
pub struct PositionLosses {
    /// Label-smoothed loss of each position of the NLL subset.
    pub smoothed_loss: Tensor,
    pub nll_loss: Tensor,
    /// `(n, T)` consistency term.
    pub kl_loss: Tensor,
    pub ntokens: u64,
    pub nsentences: u64,
    pub sample_size: u64,
}

#[derive(Debug)]
pub enum LoggingOutput {
    Reduced(LoggingRecord),
    Unreduced(PositionLosses),
}

impl LoggingOutput {
    pub fn record(&self) -> Option<&LoggingRecord> {
        match self {
            LoggingOutput::Reduced(record) => Some(record),
            LoggingOutput::Unreduced(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct RobustLossOutput {
    /// Scalar `nll_term + reg_alpha * kl_term`, ready for `backward`.
    pub loss: Tensor,
    pub sample_size: u64,
    pub logging: LoggingOutput,
    pub noise_rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RobustCriterion {
    args: CriterionArgs,
    padding_idx: i64,
}

impl RobustCriterion {
    pub fn new(args: CriterionArgs, padding_idx: i64) -> Result<Self, ConfigError> {
        args.validate()?;
        Ok(Self { args, padding_idx })
    }

    pub fn args(&self) -> &CriterionArgs {
        &self.args
    }

    pub fn logging_outputs_can_be_summed() -> bool {
        LoggingRecord::logging_outputs_can_be_summed()
    }

    /// Trims `ignore_prefix_size` leading time steps from the `(2n, T, V)`
    /// log-probabilities and the `(n, T)` target.
    pub fn get_lprobs_and_target<M: TranslationModel + ?Sized>(
        &self,
        model: &M,
        net_output: &NetOutput,
        sample: &Sample,
    ) -> Result<(Tensor, Tensor), CriterionError> {
        let lprobs = model.get_normalized_probs(net_output, true);
        let target = model.get_targets(sample, net_output);

        let rows = sample.net_input.batch_size();
        let lprobs_size = lprobs.size();
        let target_size = target.size();
        if lprobs_size.len() != 3 || lprobs_size[0] != 2 * rows {
            return Err(CriterionError::ShapeMismatch {
                what: "log-probabilities",
                expected: vec![2 * rows, target_size.get(1).copied().unwrap_or(-1), -1],
                actual: lprobs_size,
            });
        }
        if target_size.len() != 2 || target_size[0] != rows || target_size[1] != lprobs_size[1] {
            return Err(CriterionError::ShapeMismatch {
                what: "target",
                expected: vec![rows, lprobs_size[1]],
                actual: target_size,
            });
        }
        let prefix = self.args.ignore_prefix_size as i64;
        if prefix == 0 {
            return Ok((lprobs, target));
        }
        if prefix > lprobs_size[1] {
            return Err(CriterionError::ShapeMismatch {
                what: "ignored target prefix",
                expected: vec![lprobs_size[1]],
                actual: vec![prefix],
            });
        }
        let steps = lprobs_size[1] - prefix;
        Ok((
            lprobs.narrow(1, prefix, steps).contiguous(),
            target.narrow(1, prefix, steps).contiguous(),
        ))
    }

    /// Computes the robust loss of `sample`. The returned loss is always the
    /// scalar sum; with `reduce` unset the logging output carries the
    /// per-position components instead of a [`LoggingRecord`].
    pub fn forward<M: TranslationModel + ?Sized>(
        &self,
        model: &M,
        sample: &Sample,
        reduce: bool,
    ) -> Result<RobustLossOutput, CriterionError> {
        let layout = model.noise_layout();
        self.args.check_layout(layout)?;

        let net_output = model.forward(&sample.net_input.doubled())?;
        let (lprobs, target) = self.get_lprobs_and_target(model, &net_output, sample)?;
        let vocab = lprobs.size()[2];
        let rows = target.size()[0];

        let pad_mask = target.eq(self.padding_idx);
        let doubled_target = Tensor::cat(&[&target, &target], 0);
        let (start, len) = match self.args.only_nll {
            NllSubset::Both => (0, 2 * rows),
            NllSubset::Clean => (rows, rows),
            NllSubset::Noise => (0, rows),
        };
        let subset_lprobs = lprobs.narrow(0, start, len).reshape([-1, vocab]);
        let subset_target = doubled_target.narrow(0, start, len).reshape([-1]);

        let (smoothed, nll) = label_smoothed_nll_loss(
            &subset_lprobs,
            &subset_target,
            self.args.label_smoothing,
            Some(self.padding_idx),
            false,
        );
        let kl = kl_consistency_loss(&lprobs, &pad_mask, self.args.kl_direction, false);
        let kl_sum = kl.sum(Kind::Float);
        let loss = smoothed.sum(Kind::Float) + &kl_sum * self.args.reg_alpha;

        let ntokens = sample.ntokens;
        let nsentences = sample.nsentences();
        let sample_size = if self.args.sentence_avg {
            nsentences
        } else {
            ntokens
        };

        let logging = if reduce {
            let (n_correct, total) = if self.args.report_accuracy {
                self.accuracy(&subset_lprobs, &subset_target)
            } else {
                (0, 0)
            };
            let record = LoggingRecord {
                loss: loss.double_value(&[]),
                nll_loss: nll.sum(Kind::Float).double_value(&[]),
                kl_loss: kl_sum.double_value(&[]),
                ntokens,
                nsentences,
                sample_size,
                n_correct,
                total,
            };
            debug!(
                loss = record.loss,
                nll_loss = record.nll_loss,
                kl_loss = record.kl_loss,
                ntokens,
                layout = ?layout,
                "robust loss"
            );
            LoggingOutput::Reduced(record)
        } else {
            LoggingOutput::Unreduced(PositionLosses {
                smoothed_loss: smoothed.detach(),
                nll_loss: nll.detach(),
                kl_loss: kl.detach(),
                ntokens,
                nsentences,
                sample_size,
            })
        };

        Ok(RobustLossOutput {
            loss,
            sample_size,
            logging,
            noise_rate: net_output.noise_rate,
        })
    }

    fn accuracy(&self, lprobs: &Tensor, target: &Tensor) -> (u64, u64) {
        let _guard = tch::no_grad_guard();
        let mask = target.ne(self.padding_idx);
        let correct = lprobs
            .argmax(-1, false)
            .eq_tensor(target)
            .logical_and(&mask)
            .sum(Kind::Int64)
            .int64_value(&[]);
        let total = mask.sum(Kind::Int64).int64_value(&[]);
        (correct as u64, total as u64)
    }
}
