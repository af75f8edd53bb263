//! Single-direction LSTM layer used as the building block of the stacked
//! rollout.

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use candle_nn::ops::sigmoid;

/// Per-layer recurrent state: the cell and hidden tensors, each shaped
/// `(batch, hidden_size)`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub c: Tensor,
    pub h: Tensor,
}

impl LstmState {
    /// Fresh all-zero state for a batch of the given row count. State is
    /// never carried across batches; every rollout starts from here.
    pub fn zeros(batch_size: usize, hidden_size: usize, device: &Device) -> Result<Self> {
        let c = Tensor::zeros((batch_size, hidden_size), DType::F32, device)?;
        let h = Tensor::zeros((batch_size, hidden_size), DType::F32, device)?;
        Ok(Self { c, h })
    }
}

/// One LSTM layer with a fused input/recurrent kernel.
///
/// The gate layout follows the classic cell with forget bias fixed at 0.0:
/// `[x, h]·W + b` is split into input, candidate, forget and output gates.
#[derive(Debug, Clone)]
pub struct LstmLayer {
    input_size: usize,
    hidden_size: usize,
    kernel: Var,
    bias: Var,
}

impl LstmLayer {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        init_scale: f64,
        device: &Device,
    ) -> Result<Self> {
        if input_size == 0 || hidden_size == 0 {
            bail!("lstm layer requires non-zero input and hidden sizes");
        }
        let scale = init_scale as f32;
        let kernel = Var::rand(
            -scale,
            scale,
            (input_size + hidden_size, 4 * hidden_size),
            device,
        )?;
        let bias = Var::rand(-scale, scale, 4 * hidden_size, device)?;
        Ok(Self {
            input_size,
            hidden_size,
            kernel,
            bias,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Advances the layer by one time step.
    ///
    /// `input` is `(batch, input_size)`; the returned hidden output equals the
    /// new state's `h` component.
    pub fn step(&self, input: &Tensor, state: &LstmState) -> Result<LstmState> {
        let concat = Tensor::cat(&[input, &state.h], 1)?;
        let gates = concat
            .matmul(self.kernel.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;
        let chunks = gates.chunk(4, 1)?;

        let i = sigmoid(&chunks[0])?;
        let g = chunks[1].tanh()?;
        let f = sigmoid(&chunks[2])?;
        let o = sigmoid(&chunks[3])?;

        let c = ((f * &state.c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok(LstmState { c, h })
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{scope}.kernel"), self.kernel.clone()),
            (format!("{scope}.bias"), self.bias.clone()),
        ]
    }
}
