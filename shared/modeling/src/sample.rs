use robustmt_core::{BatchError, Dictionary, TokenBatch};
use tch::{Device, Kind, Tensor};

use crate::ModelError;

/// Encoder and decoder inputs of one batch, as the model consumes them.
#[derive(Debug)]
pub struct NetInput {
    /// `(batch, src_len)` source ids.
    pub src_tokens: Tensor,
    /// `(batch,)` valid source lengths.
    pub src_lengths: Tensor,
    /// `(batch, tgt_len)` decoder inputs: the target shifted right behind `</s>`.
    pub prev_output_tokens: Tensor,
}

impl NetInput {
    pub fn batch_size(&self) -> i64 {
        self.src_tokens.size().first().copied().unwrap_or(0)
    }

    /// `[x; x]` along the batch dimension for every input.
    pub fn doubled(&self) -> Self {
        let double = |t: &Tensor| Tensor::cat(&[t, t], 0);
        Self {
            src_tokens: double(&self.src_tokens),
            src_lengths: double(&self.src_lengths),
            prev_output_tokens: double(&self.prev_output_tokens),
        }
    }
}

impl Clone for NetInput {
    fn clone(&self) -> Self {
        Self {
            src_tokens: self.src_tokens.shallow_clone(),
            src_lengths: self.src_lengths.shallow_clone(),
            prev_output_tokens: self.prev_output_tokens.shallow_clone(),
        }
    }
}

/// A training or validation batch: net input, gold target and its token count.
#[derive(Debug)]
pub struct Sample {
    pub net_input: NetInput,
    /// `(batch, tgt_len)` gold ids.
    pub target: Tensor,
    /// Non-pad target tokens.
    pub ntokens: u64,
}

impl Sample {
    /// Builds a sample from a source batch and a right-padded, eos-terminated
    /// target batch. Decoder inputs are the target with eos rotated to the front.
    pub fn new<D: Dictionary + ?Sized>(
        source: &TokenBatch,
        target: &TokenBatch,
        dict: &D,
        device: Device,
    ) -> Result<Self, BatchError> {
        if source.num_rows() != target.num_rows() {
            return Err(BatchError::LengthCountMismatch {
                rows: source.num_rows(),
                lengths: target.num_rows(),
            });
        }
        let prev_output = shift_eos_to_front(target, dict.eos(), dict.pad())?;
        let (src_tokens, src_lengths) = batch_to_tensors(source, device);
        let (prev_output_tokens, _) = batch_to_tensors(&prev_output, device);
        let (target_tokens, _) = batch_to_tensors(target, device);
        Ok(Self {
            net_input: NetInput {
                src_tokens,
                src_lengths,
                prev_output_tokens,
            },
            target: target_tokens,
            ntokens: target.ntokens(dict.pad()) as u64,
        })
    }

    pub fn nsentences(&self) -> u64 {
        self.target.size().first().copied().unwrap_or(0) as u64
    }
}

impl Clone for Sample {
    fn clone(&self) -> Self {
        Self {
            net_input: self.net_input.clone(),
            target: self.target.shallow_clone(),
            ntokens: self.ntokens,
        }
    }
}

/// `[a b c </s> <pad>]` becomes `[</s> a b c <pad>]`.
pub fn shift_eos_to_front(target: &TokenBatch, eos: i64, pad: i64) -> Result<TokenBatch, BatchError> {
    let rows = target
        .rows()
        .iter()
        .zip(target.lengths())
        .map(|(row, &length)| {
            let length = (length as usize).min(row.len());
            let mut shifted = Vec::with_capacity(row.len());
            if length > 0 {
                shifted.push(eos);
                shifted.extend_from_slice(&row[..length - 1]);
            }
            shifted.resize(row.len(), pad);
            shifted
        })
        .collect();
    TokenBatch::new(rows, target.lengths().to_vec())
}

/// `(batch, width)` token tensor and `(batch,)` length tensor on `device`.
pub fn batch_to_tensors(batch: &TokenBatch, device: Device) -> (Tensor, Tensor) {
    let tokens = if batch.is_empty() {
        Tensor::zeros([0, batch.width() as i64], (Kind::Int64, device))
    } else {
        Tensor::from_slice2(batch.rows()).to_kind(Kind::Int64).to(device)
    };
    let lengths = Tensor::from_slice(batch.lengths()).to_kind(Kind::Int64).to(device);
    (tokens, lengths)
}

/// Reads a `(batch, width)` token tensor and its lengths back into a CPU batch.
pub fn tensors_to_batch(tokens: &Tensor, lengths: &Tensor) -> Result<TokenBatch, ModelError> {
    let (_, width) = tokens.size2()?;
    let tokens = tokens.to(Device::Cpu).to_kind(Kind::Int64).contiguous().view(-1);
    let lengths = lengths.to(Device::Cpu).to_kind(Kind::Int64).contiguous().view(-1);
    let flat = Vec::<i64>::try_from(&tokens)?;
    let lengths = Vec::<i64>::try_from(&lengths)?;
    Ok(TokenBatch::from_flat(&flat, width as usize, lengths)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use robustmt_core::Vocabulary;

    #[test]
    fn test_decoder_inputs_start_with_eos() {
        let vocab = Vocabulary::synthetic(16);
        let source = TokenBatch::left_padded(&[vec![4, 5, 2], vec![6, 2]], vocab.pad());
        let target = TokenBatch::right_padded(&[vec![7, 8, 9, 2], vec![10, 2]], vocab.pad());
        let sample = Sample::new(&source, &target, &vocab, Device::Cpu).unwrap();

        assert_eq!(sample.ntokens, 6);
        assert_eq!(sample.nsentences(), 2);
        assert_eq!(sample.net_input.batch_size(), 2);
        let prev = tensors_to_batch(
            &sample.net_input.prev_output_tokens,
            &Tensor::from_slice(&[4i64, 2]),
        )
        .unwrap();
        assert_eq!(prev.row(0), &[2, 7, 8, 9]);
        assert_eq!(prev.row(1), &[2, 10, 1, 1]);
    }

    #[test]
    fn test_tensor_roundtrip_and_doubling() {
        let batch = TokenBatch::right_padded(&[vec![4, 5, 6, 2], vec![7, 2]], 1);
        let (tokens, lengths) = batch_to_tensors(&batch, Device::Cpu);
        assert_eq!(tokens.size(), vec![2, 4]);
        assert_eq!(tensors_to_batch(&tokens, &lengths).unwrap(), batch);

        let input = NetInput {
            src_tokens: tokens.shallow_clone(),
            src_lengths: lengths,
            prev_output_tokens: tokens,
        };
        let doubled = input.doubled();
        assert_eq!(doubled.batch_size(), 4);
        let back = tensors_to_batch(&doubled.src_tokens, &doubled.src_lengths).unwrap();
        assert_eq!(back, batch.doubled());
    }

    #[test]
    fn test_mismatched_rows_rejected() {
        let vocab = Vocabulary::synthetic(16);
        let source = TokenBatch::right_padded(&[vec![4, 2]], vocab.pad());
        let target = TokenBatch::right_padded(&[vec![5, 2], vec![6, 2]], vocab.pad());
        assert!(Sample::new(&source, &target, &vocab, Device::Cpu).is_err());
    }
}
