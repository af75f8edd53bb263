//! Token embedding table shared by every mode of the encoder.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};

/// Learnable token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    vocab_size: usize,
    embedding_size: usize,
    weight: Var,
}

impl TokenEmbedding {
    /// Builds a new embedding table with weights drawn uniformly from
    /// `[-init_scale, init_scale]`.
    pub fn new(
        vocab_size: usize,
        embedding_size: usize,
        init_scale: f64,
        device: &Device,
    ) -> Result<Self> {
        if vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if embedding_size == 0 {
            bail!("token embedding requires embedding_size > 0");
        }
        let scale = init_scale as f32;
        let weight = Var::rand(-scale, scale, (vocab_size, embedding_size), device)?;
        Ok(Self {
            vocab_size,
            embedding_size,
            weight,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs must be shaped `(batch, steps)` with an integer dtype; outputs
    /// are `(batch, steps, embedding_size)`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let dims = token_ids.dims();
        if dims.len() != 2 {
            return Err(Error::Msg(format!(
                "token ids must be shaped [batch, steps], got {:?}",
                dims
            )));
        }

        let ids = token_ids.to_dtype(DType::I64)?;
        let flat = ids.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        let mut output_dims = dims.to_vec();
        output_dims.push(self.embedding_size);
        gathered.reshape(output_dims)
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "encountered negative token id {min_id}"
            )));
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.vocab_size as i64 {
            return Err(Error::Msg(format!(
                "token id {} exceeds vocab size {}",
                max_id, self.vocab_size
            )));
        }
        Ok(())
    }
}
