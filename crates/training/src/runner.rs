//! Epoch runner: drives one session through a batch source until the
//! end-of-data signal, accumulating the length-weighted perplexity.

use model::SeqEncoder;

use crate::{
    data::BatchSource,
    logging::Logger,
    metrics::PerplexityMeter,
    optimizer::GradientDescent,
    TrainingError,
};

const PROGRESS_EVERY_N_STEPS: usize = 100;

/// One run-mode instance: the model, the mutable global step counter and,
/// for the training mode only, the optimizer holding the learning-rate cell.
/// Only the optimizer and the orchestrator mutate the two counters.
pub struct Session {
    pub name: &'static str,
    pub model: SeqEncoder,
    pub optimizer: Option<GradientDescent>,
    pub global_step: u64,
}

impl Session {
    pub fn new(name: &'static str, model: SeqEncoder, optimizer: Option<GradientDescent>) -> Self {
        Self {
            name,
            model,
            optimizer,
            global_step: 0,
        }
    }

    pub fn is_trainable(&self) -> bool {
        self.optimizer.is_some()
    }

    /// Pushes the epoch's rate into the learning-rate cell. No-op for
    /// evaluation sessions.
    pub fn set_learning_rate(&mut self, lr: f64) {
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.set_learning_rate(lr);
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochOutcome {
    pub global_step: u64,
    pub perplexity: f64,
}

/// Runs the session over the source until exhaustion.
///
/// The caller must have `reset()` the source; exhaustion (`Ok(None)`) is the
/// loop's only termination condition and is normal control flow. Each batch
/// contributes its mean cost multiplied back by its row count to the cost
/// sum and its predict-count to the token sum; the returned perplexity is
/// `exp(cost_sum / token_sum)`.
pub fn run_epoch(
    session: &mut Session,
    source: &mut dyn BatchSource,
    logger: &mut Logger,
) -> Result<EpochOutcome, TrainingError> {
    let mut meter = PerplexityMeter::default();
    let mut step = 0usize;

    loop {
        let Some(batch) = source.next_batch()? else {
            break;
        };

        let encoding = session
            .model
            .encode(&batch.source, &batch.lengths)
            .map_err(to_runtime_error)?;
        let loss = session
            .model
            .masked_loss(&encoding.outputs, &batch.target, &batch.lengths)
            .map_err(to_runtime_error)?;
        let mean_cost = loss.cost.to_vec0::<f32>().map_err(to_runtime_error)? as f64;

        if let Some(optimizer) = session.optimizer.as_mut() {
            let mut grads = loss.cost.backward().map_err(to_runtime_error)?;
            optimizer.step(&mut grads)?;
            session.global_step += 1;
        }

        meter.add(
            mean_cost * batch.batch_size() as f64,
            loss.predict_count as u64,
        );
        step += 1;
        if step % PROGRESS_EVERY_N_STEPS == 0 {
            logger.log_progress(step, meter.running());
        }
    }

    let summary = meter.finalize().ok_or_else(|| {
        TrainingError::runtime(format!(
            "{} epoch produced no batches; the batch source contract requires at least one",
            session.name
        ))
    })?;

    Ok(EpochOutcome {
        global_step: session.global_step,
        perplexity: summary.perplexity,
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
