use candle_core::{backprop::GradStore, Tensor, Var};

use crate::TrainingError;

const EPS: f64 = 1e-12;

/// Plain gradient descent over a fixed parameter set, with the gradient
/// vector clipped by global norm before every update.
///
/// Holds the run's mutable learning-rate cell: the orchestrator writes it
/// between epochs via [`GradientDescent::set_learning_rate`] and every step
/// inside the epoch reads the current value.
#[derive(Debug)]
pub struct GradientDescent {
    params: Vec<(String, Var)>,
    learning_rate: f64,
    max_grad_norm: f64,
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

impl GradientDescent {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        learning_rate: f64,
        max_grad_norm: f64,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if learning_rate <= 0.0 {
            return Err(TrainingError::initialization(
                "optimizer requires learning rate > 0",
            ));
        }
        if max_grad_norm <= 0.0 {
            return Err(TrainingError::initialization(
                "optimizer requires max_grad_norm > 0",
            ));
        }
        Ok(Self {
            params: named_parameters,
            learning_rate,
            max_grad_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Applies one update from the gradients of a scalar cost.
    ///
    /// If the global L2 norm across every parameter gradient exceeds
    /// `max_grad_norm`, all gradients are rescaled by the one shared factor
    /// `max_grad_norm / norm`; otherwise they are left untouched. Returns the
    /// pre-clip global norm.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (index, (_, var)) in self.params.iter().enumerate() {
            let tensor = var.as_tensor();
            let Some(grad) = grads.remove(tensor) else {
                continue;
            };
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient { index, grad, norm });
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        let total_norm_sq: f64 = processed.iter().map(|g| g.norm * g.norm).sum();
        let total_norm = total_norm_sq.sqrt();
        if total_norm > self.max_grad_norm {
            let scale = self.max_grad_norm / (total_norm + EPS);
            for item in &mut processed {
                item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
            }
        }

        for item in processed {
            let (_, var) = &self.params[item.index];
            let update = item
                .grad
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = var.as_tensor().sub(&update).map_err(to_runtime_error)?;
            var.set(&next).map_err(to_runtime_error)?;
        }

        Ok(total_norm)
    }
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
