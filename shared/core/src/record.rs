use std::{
    collections::BTreeMap,
    f64::consts::LN_2,
    iter::Sum,
    ops::{Add, AddAssign},
};

use serde::{Deserialize, Serialize};

/// Per-step statistics of the robust loss. Every field is a raw sum, so records
/// from disjoint batches (or workers) combine by pointwise addition and any
/// ratio is derived only after summation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingRecord {
    pub loss: f64,
    pub nll_loss: f64,
    pub kl_loss: f64,
    pub ntokens: u64,
    pub nsentences: u64,
    pub sample_size: u64,
    /// Correct argmax predictions on the loss subset; zero unless accuracy is reported.
    #[serde(default)]
    pub n_correct: u64,
    #[serde(default)]
    pub total: u64,
}

impl LoggingRecord {
    /// Records are plain sums, so a distributed reducer may add them directly.
    pub fn logging_outputs_can_be_summed() -> bool {
        true
    }
}

impl Add for LoggingRecord {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for LoggingRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.loss += rhs.loss;
        self.nll_loss += rhs.nll_loss;
        self.kl_loss += rhs.kl_loss;
        self.ntokens += rhs.ntokens;
        self.nsentences += rhs.nsentences;
        self.sample_size += rhs.sample_size;
        self.n_correct += rhs.n_correct;
        self.total += rhs.total;
    }
}

impl Sum for LoggingRecord {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl<'a> Sum<&'a LoggingRecord> for LoggingRecord {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// A metric computed from the current meters when it is read.
pub type DerivedMetric = fn(&Meters) -> f64;

/// Destination of reduced metrics.
pub trait MetricsSink {
    /// Logs `value` into a running average weighted by `weight`.
    fn log_scalar(&mut self, name: &str, value: f64, weight: f64, round: Option<u32>);

    fn log_derived(&mut self, name: &str, derive: DerivedMetric);
}

#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: f64,
    last: f64,
    round: Option<u32>,
}

impl AverageMeter {
    pub fn update(&mut self, value: f64, weight: f64) {
        self.last = value;
        if weight > 0.0 {
            self.sum += value * weight;
            self.count += weight;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            self.last
        }
    }

    pub fn smoothed_value(&self) -> f64 {
        match self.round {
            Some(digits) => safe_round(self.avg(), digits),
            None => self.avg(),
        }
    }
}

/// In-memory [`MetricsSink`]: weighted average meters plus derived metrics.
#[derive(Debug, Clone, Default)]
pub struct Meters {
    scalars: BTreeMap<String, AverageMeter>,
    derived: BTreeMap<String, DerivedMetric>,
}

impl Meters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&AverageMeter> {
        self.scalars.get(name)
    }

    pub fn avg(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).map(AverageMeter::avg)
    }

    /// Reads a scalar (rounded) or evaluates a derived metric.
    pub fn value(&self, name: &str) -> Option<f64> {
        if let Some(meter) = self.scalars.get(name) {
            return Some(meter.smoothed_value());
        }
        self.derived.get(name).map(|derive| derive(self))
    }

    /// Every scalar and derived metric, by name.
    pub fn smoothed_values(&self) -> BTreeMap<String, f64> {
        let mut values: BTreeMap<String, f64> = self
            .scalars
            .iter()
            .map(|(name, meter)| (name.clone(), meter.smoothed_value()))
            .collect();
        for (name, derive) in &self.derived {
            values.insert(name.clone(), derive(self));
        }
        values
    }

    pub fn reset(&mut self) {
        self.scalars.clear();
        self.derived.clear();
    }
}

impl MetricsSink for Meters {
    fn log_scalar(&mut self, name: &str, value: f64, weight: f64, round: Option<u32>) {
        let meter = self.scalars.entry(name.to_string()).or_default();
        meter.round = round;
        meter.update(value, weight);
    }

    fn log_derived(&mut self, name: &str, derive: DerivedMetric) {
        self.derived.insert(name.to_string(), derive);
    }
}

pub fn safe_round(value: f64, digits: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let scale = 10f64.powi(digits as i32);
    (value * scale).round() / scale
}

/// `2^loss` rounded to `digits`; zero when no loss was logged, infinite on overflow.
pub fn get_perplexity(loss: Option<f64>, digits: u32) -> f64 {
    match loss {
        Some(loss) => safe_round(2f64.powf(loss), digits),
        None => 0.0,
    }
}

fn derived_perplexity(meters: &Meters) -> f64 {
    get_perplexity(meters.avg("nll_loss"), 2)
}

fn derived_accuracy(meters: &Meters) -> f64 {
    let total = meters.avg("total").unwrap_or(0.0);
    if total > 0.0 {
        let n_correct = meters.avg("n_correct").unwrap_or(0.0);
        safe_round(n_correct * 100.0 / total, 3)
    } else {
        f64::NAN
    }
}

/// Sums `records` and logs the reporting view: `loss` in bits per sample-size
/// unit, `nll_loss` in bits per token, `ppl = 2^nll_loss`, the raw `kl_loss`
/// sum, and accuracy when any record counted predictions.
pub fn reduce_metrics<S: MetricsSink + ?Sized>(records: &[LoggingRecord], sink: &mut S) {
    let total: LoggingRecord = records.iter().sum();
    let sample_size = total.sample_size as f64;
    let ntokens = total.ntokens as f64;

    sink.log_scalar("kl_loss", total.kl_loss, 1.0, None);
    sink.log_scalar("ntokens", ntokens, 1.0, None);
    sink.log_scalar("loss", total.loss / sample_size / LN_2, sample_size, Some(3));
    sink.log_scalar("nll_loss", total.nll_loss / ntokens / LN_2, ntokens, Some(3));
    sink.log_derived("ppl", derived_perplexity);

    if total.total > 0 {
        sink.log_scalar("total", total.total as f64, 1.0, None);
        sink.log_scalar("n_correct", total.n_correct as f64, 1.0, None);
        sink.log_derived("accuracy", derived_accuracy);
    }
}
