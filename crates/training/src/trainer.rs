//! Orchestrator: builds the per-mode sessions, sequences epochs, drives
//! checkpointing and exports the derived embedding artifacts.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use model::{EncoderConfig, SeqEncoder};

use crate::{
    checkpoint,
    data::{BatchSource, LineBatcher, Vocabulary},
    export::{self, EmbeddingWriter},
    logging::{Logger, LoggingSettings},
    optimizer::GradientDescent,
    runner::{run_epoch, Session},
    schedule::EpochSchedule,
    RunConfig, TrainingError,
};

const VOCAB_FILENAME: &str = "vocab.txt";
const INFER_PROGRESS_EVERY_N_BATCHES: usize = 100;

/// Single-threaded driver for one run. Training and inference are mutually
/// exclusive per process; the checkpoint directory is the only resource the
/// per-mode sessions share, and every save happens before the dependent load.
pub struct Trainer {
    config: RunConfig,
    device: Device,
    checkpoint_dir: PathBuf,
    logger: Logger,
}

impl Trainer {
    pub fn new(
        config: RunConfig,
        checkpoint_dir: impl Into<PathBuf>,
        logging: LoggingSettings,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let logger = Logger::new(logging)?;
        Ok(Self {
            config,
            device: select_device(),
            checkpoint_dir: checkpoint_dir.into(),
            logger,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the full training protocol over `data_dir` (expects `train`,
    /// `valid` and `test` files inside) and finally exports the normalized
    /// softmax matrix to `out_softmax`.
    pub fn train(&mut self, data_dir: &Path, out_softmax: &Path) -> Result<(), TrainingError> {
        let train_path = data_dir.join("train");
        let valid_path = data_dir.join("valid");
        let test_path = data_dir.join("test");
        for path in [&train_path, &valid_path, &test_path] {
            if !path.is_file() {
                return Err(TrainingError::initialization(format!(
                    "training data file {} does not exist",
                    path.display()
                )));
            }
        }

        let vocab = Arc::new(Vocabulary::build_from_file(
            &train_path,
            self.config.vocab_size,
        )?);
        fs::create_dir_all(&self.checkpoint_dir)?;
        vocab.save(&self.checkpoint_dir.join(VOCAB_FILENAME))?;

        let test_config = self.config.test_overrides();

        let mut train_source = LineBatcher::new(
            &train_path,
            vocab.clone(),
            self.config.batch_size,
            self.config.num_steps,
            self.device.clone(),
        )?;
        let mut valid_source = LineBatcher::new(
            &valid_path,
            vocab.clone(),
            self.config.batch_size,
            self.config.num_steps,
            self.device.clone(),
        )?;
        let mut test_source = LineBatcher::new(
            &test_path,
            vocab,
            test_config.batch_size,
            test_config.num_steps,
            self.device.clone(),
        )?;

        let mut train_session = self.build_session("train", &self.config, true)?;
        let mut valid_session = self.build_session("valid", &self.config, false)?;
        let mut test_session = self.build_session("test", &test_config, false)?;

        train_session.global_step =
            checkpoint::create_or_load(&train_session.model, &self.checkpoint_dir, "train")?;

        let schedule = EpochSchedule::from_config(&self.config)?;
        for epoch in 1..=self.config.max_epoch {
            let lr = schedule.learning_rate(epoch);
            train_session.set_learning_rate(lr);
            self.logger.log_epoch_learning_rate(epoch, lr);

            train_source.reset()?;
            let outcome = run_epoch(&mut train_session, &mut train_source, &mut self.logger)?;
            checkpoint::save_checkpoint(
                &self.checkpoint_dir,
                &train_session.model,
                outcome.global_step,
                &self.config,
            )?;
            self.logger
                .log_epoch_perplexity("Train", epoch, outcome.perplexity);

            valid_source.reset()?;
            valid_session.global_step =
                checkpoint::create_or_load(&valid_session.model, &self.checkpoint_dir, "valid")?;
            let outcome = run_epoch(&mut valid_session, &mut valid_source, &mut self.logger)?;
            self.logger
                .log_epoch_perplexity("Valid", epoch, outcome.perplexity);
        }

        test_source.reset()?;
        test_session.global_step =
            checkpoint::create_or_load(&test_session.model, &self.checkpoint_dir, "test")?;
        let outcome = run_epoch(&mut test_session, &mut test_source, &mut self.logger)?;
        self.logger
            .log_test_perplexity(self.config.max_epoch, outcome.perplexity);

        let columns = train_session
            .model
            .norm_softmax_w()
            .and_then(|weights| weights.t())
            .map_err(to_runtime_error)?
            .to_vec2::<f32>()
            .map_err(to_runtime_error)?;
        export::write_softmax_weights(out_softmax, &columns)?;
        self.logger.info(&format!(
            "wrote {} normalized softmax rows to {}",
            columns.len(),
            out_softmax.display()
        ));

        self.logger.flush();
        Ok(())
    }

    /// Streams `infer_path` through a restored model and writes one
    /// L2-normalized mean-pooled vector per input window to `out_embedding`.
    pub fn infer(&mut self, infer_path: &Path, out_embedding: &Path) -> Result<(), TrainingError> {
        if !infer_path.is_file() {
            return Err(TrainingError::initialization(format!(
                "inference data file {} does not exist",
                infer_path.display()
            )));
        }

        let vocab_path = self.checkpoint_dir.join(VOCAB_FILENAME);
        let vocab = Arc::new(Vocabulary::load(&vocab_path)?);

        let mut session = self.build_session("infer", &self.config, false)?;
        session.global_step =
            checkpoint::create_or_load(&session.model, &self.checkpoint_dir, "infer")?;

        let mut source = LineBatcher::new(
            infer_path,
            vocab,
            self.config.batch_size,
            self.config.num_steps,
            self.device.clone(),
        )?
        .with_allow_partial(true);
        source.reset()?;

        let mut writer = EmbeddingWriter::create(out_embedding)?;
        let mut batches = 0usize;
        while let Some(batch) = source.next_batch()? {
            let encoding = session
                .model
                .encode(&batch.source, &batch.lengths)
                .map_err(to_runtime_error)?;
            let pooled = session
                .model
                .norm_pooling(&encoding, &batch.lengths)
                .map_err(to_runtime_error)?;
            for row in pooled.to_vec2::<f32>().map_err(to_runtime_error)? {
                writer.push_row(&row)?;
            }
            batches += 1;
            if batches % INFER_PROGRESS_EVERY_N_BATCHES == 0 {
                self.logger.info(&format!("  batch: {batches}"));
            }
        }

        let rows = writer.finish()?;
        self.logger.info(&format!(
            "wrote {} embedding rows to {}",
            rows,
            out_embedding.display()
        ));
        Ok(())
    }

    fn build_session(
        &self,
        name: &'static str,
        config: &RunConfig,
        trainable: bool,
    ) -> Result<Session, TrainingError> {
        let encoder_config = EncoderConfig {
            vocab_size: config.vocab_size,
            embedding_size: config.embedding_size,
            hidden_size: config.hidden_size,
            num_layers: config.num_layers,
            keep_prob: config.keep_prob,
            init_scale: config.init_scale,
            device: self.device.clone(),
        };
        let mut encoder = SeqEncoder::new(encoder_config).map_err(to_runtime_error)?;
        encoder.set_training(trainable);

        let optimizer = if trainable {
            Some(GradientDescent::new(
                encoder.named_parameters(),
                config.lr,
                config.max_grad_norm,
            )?)
        } else {
            None
        };

        Ok(Session::new(name, encoder, optimizer))
    }
}

fn select_device() -> Device {
    if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(err) => eprintln!("failed to initialize cuda device, falling back: {err}"),
        }
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => eprintln!("failed to initialize metal device, falling back: {err}"),
        }
    }
    Device::Cpu
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
