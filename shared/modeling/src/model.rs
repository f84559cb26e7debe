use robustmt_core::{BatchError, NoiseError, NoiseLayout};
use tch::{Device, Kind, TchError, Tensor, nn};
use thiserror::Error;

use crate::{NetInput, Sample};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("source corruption failed: {0}")]
    Noise(#[from] NoiseError),

    #[error("invalid token batch: {0}")]
    Batch(#[from] BatchError),

    #[error("torch error: {0}")]
    Torch(#[from] TchError),

    #[error("noise injector lock poisoned")]
    InjectorPoisoned,
}

/// What a forward pass produces.
#[derive(Debug)]
pub struct NetOutput {
    /// `(batch, tgt_len, vocab)` unnormalized scores.
    pub logits: Tensor,
    /// Mean corruption rate applied to the source rows, when noise ran.
    pub noise_rate: Option<f64>,
}

/// An encoder-decoder translation model the robust criterion can drive.
///
/// Any source corruption happens inside `forward`, before embedding, and only
/// while `training()` is set. [`TranslationModel::noise_layout`] tells the
/// criterion which rows of a doubled batch come out corrupted.
pub trait TranslationModel: Send {
    fn forward(&self, net_input: &NetInput) -> Result<NetOutput, ModelError>;

    fn get_normalized_probs(&self, net_output: &NetOutput, log_probs: bool) -> Tensor {
        if log_probs {
            net_output.logits.log_softmax(-1, Kind::Float)
        } else {
            net_output.logits.softmax(-1, Kind::Float)
        }
    }

    fn get_targets(&self, sample: &Sample, _net_output: &NetOutput) -> Tensor {
        sample.target.shallow_clone()
    }

    fn num_updates(&self) -> u64;
    fn set_num_updates(&self, num_updates: u64);
    fn training(&self) -> bool;
    fn set_training(&self, training: bool);
    fn noise_layout(&self) -> NoiseLayout;
    fn device(&self) -> Device;
    fn var_store(&self) -> &nn::VarStore;
}
