use candle_core::{Device, Error, Result, Tensor, Var};
use candle_nn::ops::dropout;

use crate::{
    config::EncoderConfig,
    embedding::TokenEmbedding,
    lstm::{LstmLayer, LstmState},
};

/// Result of one rollout over a batch.
pub struct Encoding {
    /// Per-step hidden outputs of the top layer, `(batch, steps, hidden)`.
    /// Positions at or beyond an example's valid length are zero.
    pub outputs: Tensor,
    /// Final `(cell, hidden)` pair per layer. Each example's state is frozen
    /// at its valid length, so padding never reaches it.
    pub final_states: Vec<LstmState>,
}

/// Stacked LSTM sequence encoder with a softmax projection head.
///
/// All trainable parameters are plain `Var`s exposed through
/// [`SeqEncoder::named_parameters`]; the names and shapes are the checkpoint
/// schema shared by every per-mode instance.
pub struct SeqEncoder {
    config: EncoderConfig,
    embedding: TokenEmbedding,
    layers: Vec<LstmLayer>,
    pub(crate) softmax_w: Var,
    pub(crate) softmax_b: Var,
    training: bool,
}

impl SeqEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        config.validate()?;

        let embedding = TokenEmbedding::new(
            config.vocab_size,
            config.embedding_size,
            config.init_scale,
            &config.device,
        )?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            let input_size = if layer == 0 {
                config.embedding_size
            } else {
                config.hidden_size
            };
            layers.push(LstmLayer::new(
                input_size,
                config.hidden_size,
                config.init_scale,
                &config.device,
            )?);
        }

        let scale = config.init_scale as f32;
        let softmax_w = Var::rand(
            -scale,
            scale,
            (config.hidden_size, config.vocab_size),
            &config.device,
        )?;
        let softmax_b = Var::rand(-scale, scale, config.vocab_size, &config.device)?;

        Ok(Self {
            config,
            embedding,
            layers,
            softmax_w,
            softmax_b,
            training: false,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.config.device
    }

    /// Dropout is consumed only while training with `keep_prob < 1`.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn dropout_active(&self) -> bool {
        self.training && self.config.keep_prob < 1.0
    }

    /// Runs the stacked rollout over a `(batch, steps)` id tensor.
    ///
    /// `lengths[b]` gates example `b`: steps at or beyond it still execute on
    /// the padding ids, but the example's recurrent state keeps the value it
    /// had at `lengths[b]` and its per-step output is zeroed.
    pub fn encode(&self, token_ids: &Tensor, lengths: &[usize]) -> Result<Encoding> {
        let (batch_size, num_steps) = token_ids.dims2()?;
        if lengths.len() != batch_size {
            return Err(Error::Msg(format!(
                "expected {} lengths for the batch, got {}",
                batch_size,
                lengths.len()
            )));
        }
        for (row, &len) in lengths.iter().enumerate() {
            if len > num_steps {
                return Err(Error::Msg(format!(
                    "length {} of row {} exceeds num_steps {}",
                    len, row, num_steps
                )));
            }
        }

        let drop_p = (1.0 - self.config.keep_prob) as f32;
        let mut inputs = self.embedding.forward(token_ids)?;
        if self.dropout_active() {
            inputs = dropout(&inputs, drop_p)?;
        }

        let mask = length_mask(lengths, num_steps, &self.config.device)?;

        let mut states = Vec::with_capacity(self.layers.len());
        for _ in &self.layers {
            states.push(LstmState::zeros(
                batch_size,
                self.config.hidden_size,
                &self.config.device,
            )?);
        }

        let mut step_outputs = Vec::with_capacity(num_steps);
        for t in 0..num_steps {
            let keep = mask.narrow(1, t, 1)?;
            let frozen = keep.affine(-1.0, 1.0)?;

            let mut layer_input = inputs.narrow(1, t, 1)?.squeeze(1)?;
            for (layer, state) in self.layers.iter().zip(states.iter_mut()) {
                let next = layer.step(&layer_input, state)?;
                let c = (next.c.broadcast_mul(&keep)? + state.c.broadcast_mul(&frozen)?)?;
                let h = (next.h.broadcast_mul(&keep)? + state.h.broadcast_mul(&frozen)?)?;

                let mut output = next.h.broadcast_mul(&keep)?;
                if self.dropout_active() {
                    output = dropout(&output, drop_p)?;
                }

                *state = LstmState { c, h };
                layer_input = output;
            }
            step_outputs.push(layer_input);
        }

        let outputs = Tensor::stack(&step_outputs, 1)?;
        Ok(Encoding {
            outputs,
            final_states: states,
        })
    }

    /// The checkpoint schema: every trainable parameter with its stable name.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.embedding.named_parameters("embedding");
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("lstm.{index}")));
        }
        params.push(("softmax.weight".to_string(), self.softmax_w.clone()));
        params.push(("softmax.bias".to_string(), self.softmax_b.clone()));
        params
    }
}

/// Float mask shaped `(batch, steps)`: 1.0 where `step < lengths[row]`.
pub(crate) fn length_mask(
    lengths: &[usize],
    num_steps: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut data = Vec::with_capacity(lengths.len() * num_steps);
    for &len in lengths {
        for t in 0..num_steps {
            data.push(if t < len { 1f32 } else { 0f32 });
        }
    }
    Tensor::from_vec(data, (lengths.len(), num_steps), device)
}
