use std::sync::{Arc, Mutex};

use robustmt_core::{Dictionary, NoiseInjector, NoiseLayout};
use tch::Tensor;
use tracing::trace;

use crate::{ModelError, batch_to_tensors, tensors_to_batch};

/// Source tokens after the encoder front-end ran.
#[derive(Debug)]
pub struct NoisedSource {
    pub src_tokens: Tensor,
    pub src_lengths: Tensor,
    /// Mean rate over corrupted rows; `None` when nothing was corrupted.
    pub noise_rate: Option<f64>,
}

/// Encoder front-end that corrupts source tokens before they are embedded.
///
/// The injector carries a random generator and curriculum state across steps,
/// so it lives behind a mutex and the model's `forward` can stay `&self`.
pub struct NoisyEncoderInput {
    dictionary: Arc<dyn Dictionary + Send + Sync>,
    injector: Mutex<NoiseInjector>,
    layout: NoiseLayout,
}

impl std::fmt::Debug for NoisyEncoderInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoisyEncoderInput")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl NoisyEncoderInput {
    pub fn new(injector: NoiseInjector, dictionary: Arc<dyn Dictionary + Send + Sync>) -> Self {
        let layout = injector.layout();
        Self {
            dictionary,
            injector: Mutex::new(injector),
            layout,
        }
    }

    pub fn layout(&self) -> NoiseLayout {
        self.layout
    }

    pub fn dictionary(&self) -> &(dyn Dictionary + Send + Sync) {
        self.dictionary.as_ref()
    }

    /// Curriculum ceiling of the underlying injector, if one is configured.
    pub fn ceiling(&self) -> Result<Option<f64>, ModelError> {
        let injector = self
            .injector
            .lock()
            .map_err(|_| ModelError::InjectorPoisoned)?;
        Ok(injector.ceiling())
    }

    /// Corrupts `(src_tokens, src_lengths)` according to the injector's
    /// configuration. Returns the inputs untouched outside training or when
    /// noise is disabled.
    pub fn apply(
        &self,
        src_tokens: &Tensor,
        src_lengths: &Tensor,
        training: bool,
        num_updates: u64,
    ) -> Result<NoisedSource, ModelError> {
        if !training || self.layout == NoiseLayout::Disabled {
            return Ok(NoisedSource {
                src_tokens: src_tokens.shallow_clone(),
                src_lengths: src_lengths.shallow_clone(),
                noise_rate: None,
            });
        }
        let batch = tensors_to_batch(src_tokens, src_lengths)?;
        let injection = {
            let mut injector = self
                .injector
                .lock()
                .map_err(|_| ModelError::InjectorPoisoned)?;
            injector.inject(&batch, self.dictionary.as_ref(), training, num_updates)?
        };
        trace!(
            rows = batch.num_rows(),
            width = injection.batch.width(),
            rate = injection.mean_rate(),
            skipped = injection.skipped,
            "corrupted source batch"
        );
        let (tokens, lengths) = batch_to_tensors(&injection.batch, src_tokens.device());
        Ok(NoisedSource {
            src_tokens: tokens,
            src_lengths: lengths,
            noise_rate: Some(injection.mean_rate()),
        })
    }
}
