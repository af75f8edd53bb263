use crate::{RunConfig, TrainingError};

/// Epoch-indexed learning-rate decay policy.
///
/// The first `nodecay_epochs` epochs run at the base rate; after that the
/// rate decays multiplicatively once per epoch. The rate is pushed into the
/// optimizer before an epoch's training pass and never changes mid-epoch.
#[derive(Debug, Clone)]
pub struct EpochSchedule {
    base_lr: f64,
    decay: f64,
    nodecay_epochs: usize,
}

impl EpochSchedule {
    pub fn new(base_lr: f64, decay: f64, nodecay_epochs: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "schedule requires base learning rate > 0",
            ));
        }
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(TrainingError::initialization(
                "schedule requires decay in (0, 1]",
            ));
        }
        Ok(Self {
            base_lr,
            decay,
            nodecay_epochs,
        })
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, TrainingError> {
        Self::new(config.lr, config.lr_decay, config.lr_nodecay_step)
    }

    /// Rate for the 1-based epoch index:
    /// `base_lr * decay^max(epoch - nodecay_epochs, 0)`.
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        let exponent = epoch.saturating_sub(self.nodecay_epochs);
        self.base_lr * self.decay.powi(exponent as i32)
    }
}
