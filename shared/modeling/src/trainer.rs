use robustmt_core::LoggingRecord;
use serde::{Deserialize, Serialize};
use tch::{TchError, nn, nn::OptimizerConfig};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{CriterionError, RobustCriterion, Sample, TranslationModel};

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("failed to build optimizer: {0}")]
    Optimizer(#[source] TchError),

    #[error(transparent)]
    Criterion(#[from] CriterionError),

    #[error("step produced no reduced logging record")]
    NoRecord,
}

fn default_learning_rate() -> f64 {
    5e-4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Clip the global gradient norm to this value before each update.
    #[serde(default)]
    pub clip_norm: Option<f64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            clip_norm: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub record: LoggingRecord,
    /// Update counter after the step.
    pub num_updates: u64,
    pub noise_rate: Option<f64>,
}

/// Drives one model with the robust criterion: doubled forward, backward on
/// the loss normalized by the sample size, optimizer update.
pub struct RobustTrainer<M: TranslationModel> {
    model: M,
    criterion: RobustCriterion,
    optimizer: nn::Optimizer,
    config: TrainerConfig,
}

impl<M: TranslationModel> RobustTrainer<M> {
    pub fn new(model: M, criterion: RobustCriterion, config: TrainerConfig) -> Result<Self, TrainerError> {
        let optimizer = nn::Adam::default()
            .build(model.var_store(), config.learning_rate)
            .map_err(TrainerError::Optimizer)?;
        Ok(Self {
            model,
            criterion,
            optimizer,
            config,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn criterion(&self) -> &RobustCriterion {
        &self.criterion
    }

    pub fn num_updates(&self) -> u64 {
        self.model.num_updates()
    }

    pub fn train_step(&mut self, sample: &Sample) -> Result<TrainOutput, TrainerError> {
        self.model.set_training(true);
        self.optimizer.zero_grad();

        let output = self.criterion.forward(&self.model, sample, true)?;
        let record = *output.logging.record().ok_or(TrainerError::NoRecord)?;
        let normalized = &output.loss / output.sample_size.max(1) as f64;
        normalized.backward();
        if let Some(clip_norm) = self.config.clip_norm {
            self.optimizer.clip_grad_norm(clip_norm);
        }
        self.optimizer.step();

        let num_updates = self.model.num_updates() + 1;
        self.model.set_num_updates(num_updates);
        debug!(
            num_updates,
            loss = record.loss,
            sample_size = record.sample_size,
            noise_rate = output.noise_rate,
            "train step"
        );
        Ok(TrainOutput {
            record,
            num_updates,
            noise_rate: output.noise_rate,
        })
    }

    /// Evaluates `sample` without gradients and without source corruption.
    pub fn valid_step(&mut self, sample: &Sample) -> Result<LoggingRecord, TrainerError> {
        let was_training = self.model.training();
        self.model.set_training(false);
        let output = tch::no_grad(|| self.criterion.forward(&self.model, sample, true));
        self.model.set_training(was_training);

        let output = output?;
        let record = *output.logging.record().ok_or(TrainerError::NoRecord)?;
        trace!(loss = record.loss, ntokens = record.ntokens, "valid step");
        Ok(record)
    }
}
