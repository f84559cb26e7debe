//! Per-step training metrics in JSONL form, so runs with different noise
//! settings (or different builds) can be compared step by step.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    f64::consts::LN_2,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use robustmt_core::{LoggingRecord, get_perplexity};

use crate::TrainOutput;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed metrics line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Metrics recorded for a single training step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    /// Combined loss in bits per sample-size unit.
    pub loss: f64,
    /// NLL in bits per target token.
    pub nll_loss: f64,
    /// Raw summed consistency term.
    pub kl_loss: f64,
    pub ppl: f64,
    pub ntokens: u64,
    /// Mean source corruption rate of the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_rate: Option<f64>,
    /// Timestamp in milliseconds since UNIX epoch
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl StepMetrics {
    pub fn from_record(step: u64, record: &LoggingRecord, noise_rate: Option<f64>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let sample_size = record.sample_size.max(1) as f64;
        let ntokens = record.ntokens.max(1) as f64;
        let nll_loss = record.nll_loss / ntokens / LN_2;

        Self {
            step,
            loss: record.loss / sample_size / LN_2,
            nll_loss,
            kl_loss: record.kl_loss,
            ppl: get_perplexity(Some(nll_loss), 2),
            ntokens: record.ntokens,
            noise_rate,
            timestamp_ms,
            metadata: None,
        }
    }

    pub fn from_train_output(output: &TrainOutput) -> Self {
        Self::from_record(output.num_updates, &output.record, output.noise_rate)
    }

    /// Add metadata key-value pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Path to the JSONL output file
    pub output_path: PathBuf,
    /// Record metrics every N steps (1 = every step)
    pub record_every_n_steps: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_path: PathBuf::from("robust_metrics.jsonl"),
            record_every_n_steps: 1,
        }
    }
}

impl MetricsConfig {
    pub fn enabled(output_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    pub fn record_every(mut self, n: u64) -> Self {
        self.record_every_n_steps = n.max(1);
        self
    }
}

/// Appends [`StepMetrics`] to a JSONL file.
pub struct MetricsRecorder {
    config: MetricsConfig,
    writer: Option<BufWriter<File>>,
    steps_recorded: u64,
}

impl MetricsRecorder {
    pub fn new(config: MetricsConfig) -> Result<Self, MetricsError> {
        let writer = if config.enabled {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output_path)?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            config,
            writer,
            steps_recorded: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            writer: None,
            steps_recorded: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.writer.is_some()
    }

    pub fn should_record(&self, step: u64) -> bool {
        self.is_enabled() && step.is_multiple_of(self.config.record_every_n_steps.max(1))
    }

    pub fn record(&mut self, metrics: &StepMetrics) -> Result<(), MetricsError> {
        if let Some(writer) = &mut self.writer {
            let json = serde_json::to_string(metrics)?;
            writeln!(writer, "{json}")?;
            writer.flush()?;
            self.steps_recorded += 1;
        }
        Ok(())
    }

    /// Records a finished train step if it falls on the recording period.
    pub fn record_step(&mut self, output: &TrainOutput) -> Result<(), MetricsError> {
        if !self.should_record(output.num_updates) {
            return Ok(());
        }
        self.record(&StepMetrics::from_train_output(output))
    }

    pub fn steps_recorded(&self) -> u64 {
        self.steps_recorded
    }

    pub fn output_path(&self) -> &Path {
        &self.config.output_path
    }

    pub fn flush(&mut self) -> Result<(), MetricsError> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for MetricsRecorder {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

pub fn load_metrics(path: impl AsRef<Path>) -> Result<Vec<StepMetrics>, MetricsError> {
    let reader = BufReader::new(File::open(path)?);
    let mut metrics = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let step_metrics = serde_json::from_str(&line).map_err(|source| MetricsError::Parse {
            line: index + 1,
            source,
        })?;
        metrics.push(step_metrics);
    }

    Ok(metrics)
}

/// Comparison result between two metrics runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsComparison {
    pub steps_compared: u64,
    pub max_loss_diff: f64,
    pub mean_loss_diff: f64,
    /// Largest absolute difference of the consistency term.
    pub max_kl_diff: f64,
    /// Step with maximum loss difference
    pub max_diff_step: u64,
    pub final_loss_diff: f64,
    /// Whether the comparison passed (within tolerance)
    pub passed: bool,
    pub tolerance: f64,
}

/// Compares two runs step by step on `loss`; passes when no step differs by
/// more than `tolerance`.
pub fn compare_metrics(
    baseline: &[StepMetrics],
    current: &[StepMetrics],
    tolerance: f64,
) -> MetricsComparison {
    let steps_compared = baseline.len().min(current.len()) as u64;
    let mut max_loss_diff = 0.0f64;
    let mut max_kl_diff = 0.0f64;
    let mut max_diff_step = 0;
    let mut total_diff = 0.0f64;

    for (b, c) in baseline.iter().zip(current.iter()) {
        let diff = (b.loss - c.loss).abs();
        total_diff += diff;
        max_kl_diff = max_kl_diff.max((b.kl_loss - c.kl_loss).abs());

        if diff > max_loss_diff {
            max_loss_diff = diff;
            max_diff_step = b.step;
        }
    }

    let mean_loss_diff = if steps_compared > 0 {
        total_diff / steps_compared as f64
    } else {
        0.0
    };

    let final_loss_diff = match (baseline.last(), current.last()) {
        (Some(b), Some(c)) => (b.loss - c.loss).abs(),
        _ => 0.0,
    };

    MetricsComparison {
        steps_compared,
        max_loss_diff,
        mean_loss_diff,
        max_kl_diff,
        max_diff_step,
        final_loss_diff,
        passed: max_loss_diff <= tolerance,
        tolerance,
    }
}
