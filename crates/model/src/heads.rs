//! Derived outputs of the encoder: the masked language-model loss and the
//! L2-normalized representations exported for downstream embedding use.

use candle_core::{DType, Error, Result, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::encoder::{length_mask, Encoding, SeqEncoder};

/// Divisor guard so time steps where every example is already padding
/// contribute zero loss instead of dividing by zero.
const MASK_EPS: f64 = 1e-12;

/// Epsilon inside the L2 norm, matching `x / sqrt(sum(x^2) + 1e-12)`.
const NORM_EPS: f64 = 1e-12;

/// Masked sequence loss for one batch.
pub struct SequenceLoss {
    /// Scalar cost: per time step, the masked cross entropy is summed over
    /// the batch and divided by the number of live sequences at that step;
    /// the per-step quotients are then summed with no time averaging.
    pub cost: Tensor,
    /// Total number of predicted tokens, the perplexity denominator.
    pub predict_count: usize,
}

impl SeqEncoder {
    /// Computes the masked next-token loss over the rollout outputs.
    ///
    /// `targets` is `(batch, steps)`; positions at or beyond `lengths[b]` are
    /// masked out, so their ids never influence the cost.
    pub fn masked_loss(
        &self,
        outputs: &Tensor,
        targets: &Tensor,
        lengths: &[usize],
    ) -> Result<SequenceLoss> {
        let (batch_size, num_steps, hidden_size) = outputs.dims3()?;
        if targets.dims() != [batch_size, num_steps] {
            return Err(Error::Msg(format!(
                "targets must be shaped [{}, {}], got {:?}",
                batch_size,
                num_steps,
                targets.dims()
            )));
        }

        let flat = outputs.reshape((batch_size * num_steps, hidden_size))?;
        let logits = flat
            .matmul(self.softmax_w.as_tensor())?
            .broadcast_add(self.softmax_b.as_tensor())?;
        let log_probs = log_softmax(&logits, D::Minus1)?;

        let target_ids = targets
            .to_dtype(DType::U32)?
            .reshape((batch_size * num_steps,))?;
        let nll = log_probs
            .gather(&target_ids.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?
            .reshape((batch_size, num_steps))?;

        let mask = length_mask(lengths, num_steps, outputs.device())?;
        let masked = (nll * &mask)?;
        let step_sums = masked.sum(0)?;
        let live_rows = mask.sum(0)?.affine(1.0, MASK_EPS)?;
        let cost = step_sums.div(&live_rows)?.sum_all()?;

        Ok(SequenceLoss {
            cost,
            predict_count: lengths.iter().sum(),
        })
    }

    /// Final hidden state of the top layer, L2-normalized per example.
    pub fn norm_hidden_output(&self, encoding: &Encoding) -> Result<Tensor> {
        let last = encoding
            .final_states
            .last()
            .ok_or_else(|| Error::Msg("encoder produced no layer states".into()))?;
        l2_normalize(&last.h, 1)
    }

    /// Mean pooling over the valid steps, L2-normalized per example.
    ///
    /// The per-step outputs are already zero beyond each example's length, so
    /// the time-axis sum divided by the length is the mean of the live steps.
    pub fn norm_pooling(&self, encoding: &Encoding, lengths: &[usize]) -> Result<Tensor> {
        let pooled = encoding.outputs.sum(1)?;
        let device = encoding.outputs.device();
        let divisors: Vec<f32> = lengths.iter().map(|&len| len as f32).collect();
        let divisors = Tensor::from_vec(divisors, (lengths.len(), 1), device)?;
        let mean = pooled.broadcast_div(&divisors)?;
        l2_normalize(&mean, 1)
    }

    /// Softmax projection with every vocabulary column scaled to unit norm,
    /// shaped `(hidden, vocab)`. Exported once at the end of training.
    pub fn norm_softmax_w(&self) -> Result<Tensor> {
        l2_normalize(self.softmax_w.as_tensor(), 0)
    }
}

fn l2_normalize(tensor: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = tensor
        .sqr()?
        .sum_keepdim(dim)?
        .affine(1.0, NORM_EPS)?
        .sqrt()?;
    tensor.broadcast_div(&norm)
}
