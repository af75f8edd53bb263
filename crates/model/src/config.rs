use candle_core::{Device, Error, Result};

/// High-level configuration for assembling the stacked recurrent encoder.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    /// Probability of keeping an activation when dropout is active.
    pub keep_prob: f64,
    /// Parameters are drawn uniformly from `[-init_scale, init_scale]`.
    pub init_scale: f64,
    pub device: Device,
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.embedding_size == 0 {
            return Err(Error::Msg(
                "embedding_size must be greater than zero".into(),
            ));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_layers == 0 {
            return Err(Error::Msg("num_layers must be greater than zero".into()));
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(Error::Msg("keep_prob must be in (0, 1]".into()));
        }
        if self.init_scale <= 0.0 {
            return Err(Error::Msg("init_scale must be positive".into()));
        }
        Ok(())
    }
}
