use anyhow::Result;
use candle_core::{Device, Tensor};
use model::{EncoderConfig, SeqEncoder};
use training::{
    data::{Batch, BatchSource},
    run_epoch, GradientDescent, Logger, LoggingSettings, Session, TrainingError,
};

/// Fixed in-memory batch stream for exercising the epoch loop.
struct VecSource {
    batches: Vec<Batch>,
    cursor: usize,
}

impl VecSource {
    fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl BatchSource for VecSource {
    fn reset(&mut self) -> Result<(), TrainingError> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError> {
        let Some(batch) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(batch.clone()))
    }
}

fn build_encoder() -> Result<SeqEncoder> {
    Ok(SeqEncoder::new(EncoderConfig {
        vocab_size: 8,
        embedding_size: 3,
        hidden_size: 4,
        num_layers: 1,
        keep_prob: 1.0,
        init_scale: 0.05,
        device: Device::Cpu,
    })?)
}

fn batch(source: &[u32], target: &[u32], lengths: &[usize], steps: usize) -> Result<Batch> {
    let rows = lengths.len();
    Ok(Batch {
        source: Tensor::from_slice(source, (rows, steps), &Device::Cpu)?,
        target: Tensor::from_slice(target, (rows, steps), &Device::Cpu)?,
        lengths: lengths.to_vec(),
    })
}

fn synthetic_batches() -> Result<Vec<Batch>> {
    Ok(vec![
        batch(&[1, 2, 3, 4, 5, 6], &[2, 3, 0, 5, 6, 0], &[3, 3], 3)?,
        batch(&[7, 1, 0, 2, 4, 0], &[1, 0, 0, 4, 0, 0], &[2, 2], 3)?,
        batch(&[3, 3, 3, 5, 2, 0], &[3, 3, 0, 2, 0, 0], &[3, 2], 3)?,
    ])
}

fn silent_logger() -> Logger {
    Logger::new(LoggingSettings::silent()).unwrap()
}

#[test]
fn evaluation_perplexity_matches_manual_accumulation() -> Result<()> {
    let encoder = build_encoder()?;
    let batches = synthetic_batches()?;

    // Recompute the statistic by hand: exp(sum(cost * rows) / sum(lengths)).
    let mut cost_sum = 0f64;
    let mut token_sum = 0u64;
    for batch in &batches {
        let encoding = encoder.encode(&batch.source, &batch.lengths)?;
        let loss = encoder.masked_loss(&encoding.outputs, &batch.target, &batch.lengths)?;
        cost_sum += loss.cost.to_vec0::<f32>()? as f64 * batch.batch_size() as f64;
        token_sum += loss.predict_count as u64;
    }
    let expected = (cost_sum / token_sum as f64).exp();
    assert_eq!(token_sum, 15);

    let mut session = Session::new("valid", encoder, None);
    let mut source = VecSource::new(batches);
    let mut logger = silent_logger();

    source.reset()?;
    let outcome = run_epoch(&mut session, &mut source, &mut logger)?;

    assert!((outcome.perplexity - expected).abs() < 1e-9);
    assert_eq!(outcome.global_step, 0);
    Ok(())
}

#[test]
fn evaluation_is_deterministic_without_an_optimizer() -> Result<()> {
    let encoder = build_encoder()?;
    let mut session = Session::new("valid", encoder, None);
    let mut source = VecSource::new(synthetic_batches()?);
    let mut logger = silent_logger();

    source.reset()?;
    let first = run_epoch(&mut session, &mut source, &mut logger)?;
    source.reset()?;
    let second = run_epoch(&mut session, &mut source, &mut logger)?;

    assert_eq!(first.perplexity, second.perplexity);
    Ok(())
}

#[test]
fn training_increments_the_global_step_per_batch() -> Result<()> {
    let mut encoder = build_encoder()?;
    encoder.set_training(true);
    let optimizer = GradientDescent::new(encoder.named_parameters(), 0.1, 5.0)?;
    let mut session = Session::new("train", encoder, Some(optimizer));
    let mut source = VecSource::new(synthetic_batches()?);
    let mut logger = silent_logger();

    source.reset()?;
    let outcome = run_epoch(&mut session, &mut source, &mut logger)?;
    assert_eq!(outcome.global_step, 3);

    // A second epoch keeps counting from where the first stopped.
    source.reset()?;
    let outcome = run_epoch(&mut session, &mut source, &mut logger)?;
    assert_eq!(outcome.global_step, 6);
    Ok(())
}

#[test]
fn updates_change_the_reported_perplexity() -> Result<()> {
    let mut encoder = build_encoder()?;
    encoder.set_training(true);
    let optimizer = GradientDescent::new(encoder.named_parameters(), 0.5, 5.0)?;
    let mut session = Session::new("train", encoder, Some(optimizer));
    let mut source = VecSource::new(synthetic_batches()?);
    let mut logger = silent_logger();

    source.reset()?;
    let first = run_epoch(&mut session, &mut source, &mut logger)?;
    source.reset()?;
    let second = run_epoch(&mut session, &mut source, &mut logger)?;

    assert_ne!(first.perplexity, second.perplexity);
    Ok(())
}

#[test]
fn an_epoch_with_no_batches_is_a_contract_violation() -> Result<()> {
    let encoder = build_encoder()?;
    let mut session = Session::new("valid", encoder, None);
    let mut source = VecSource::new(Vec::new());
    let mut logger = silent_logger();

    source.reset()?;
    assert!(run_epoch(&mut session, &mut source, &mut logger).is_err());
    Ok(())
}
