mod criterion;
mod dummy;
pub mod metrics;
mod model;
mod noisy_encoder;
mod sample;
mod trainer;

pub use criterion::{
    CriterionError, LoggingOutput, PositionLosses, RobustCriterion, RobustLossOutput,
    kl_consistency_loss, label_smoothed_nll_loss,
};
pub use dummy::DummyTranslationModel;
pub use model::{ModelError, NetOutput, TranslationModel};
pub use noisy_encoder::{NoisedSource, NoisyEncoderInput};
pub use sample::{NetInput, Sample, batch_to_tensors, shift_eos_to_front, tensors_to_batch};
pub use trainer::{RobustTrainer, TrainOutput, TrainerConfig, TrainerError};
