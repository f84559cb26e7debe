use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use robustmt_core::{Dictionary, NoiseInjector, NoiseLayout};
use tch::{
    Device, Kind, Tensor,
    nn::{self, Module},
};

use crate::{ModelError, NetInput, NetOutput, NoisyEncoderInput, TranslationModel};

/// A tiny encoder-decoder: the encoder mean-pools source embeddings, the
/// decoder adds that summary to each target embedding and projects onto the
/// vocabulary. Source corruption runs in front of the encoder embedding.
#[derive(Debug)]
pub struct DummyTranslationModel {
    var_store: nn::VarStore,
    src_embed: nn::Embedding,
    tgt_embed: nn::Embedding,
    output_projection: nn::Linear,
    encoder_input: NoisyEncoderInput,
    pad: i64,
    num_updates: AtomicU64,
    training: AtomicBool,
}

impl DummyTranslationModel {
    pub fn new(
        dictionary: Arc<dyn Dictionary + Send + Sync>,
        injector: NoiseInjector,
        embed_dim: i64,
        device: Device,
    ) -> Self {
        let var_store = nn::VarStore::new(device);
        let root = var_store.root();
        let vocab = dictionary.len() as i64;
        let src_embed = nn::embedding(&root / "src_embed", vocab, embed_dim, Default::default());
        let tgt_embed = nn::embedding(&root / "tgt_embed", vocab, embed_dim, Default::default());
        let output_projection =
            nn::linear(&root / "output_projection", embed_dim, vocab, Default::default());
        let pad = dictionary.pad();
        Self {
            var_store,
            src_embed,
            tgt_embed,
            output_projection,
            encoder_input: NoisyEncoderInput::new(injector, dictionary),
            pad,
            num_updates: AtomicU64::new(0),
            training: AtomicBool::new(true),
        }
    }

    pub fn encoder_input(&self) -> &NoisyEncoderInput {
        &self.encoder_input
    }

    fn encode(&self, src_tokens: &Tensor) -> Tensor {
        let mask = src_tokens.ne(self.pad).to_kind(Kind::Float).unsqueeze(-1);
        let embedded = self.src_embed.forward(src_tokens) * &mask;
        let counts = mask.sum_dim_intlist(1, false, Kind::Float).clamp_min(1.0);
        embedded.sum_dim_intlist(1, false, Kind::Float) / counts
    }
}

impl TranslationModel for DummyTranslationModel {
    fn forward(&self, net_input: &NetInput) -> Result<NetOutput, ModelError> {
        let source = self.encoder_input.apply(
            &net_input.src_tokens,
            &net_input.src_lengths,
            self.training(),
            self.num_updates(),
        )?;
        let summary = self.encode(&source.src_tokens);
        let hidden = (self.tgt_embed.forward(&net_input.prev_output_tokens) + summary.unsqueeze(1)).tanh();
        Ok(NetOutput {
            logits: self.output_projection.forward(&hidden),
            noise_rate: source.noise_rate,
        })
    }

    fn num_updates(&self) -> u64 {
        self.num_updates.load(Ordering::Relaxed)
    }

    fn set_num_updates(&self, num_updates: u64) {
        self.num_updates.store(num_updates, Ordering::Relaxed);
    }

    fn training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn noise_layout(&self) -> NoiseLayout {
        self.encoder_input.layout()
    }

    fn device(&self) -> Device {
        self.var_store.device()
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }
}
