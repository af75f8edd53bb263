use std::path::PathBuf;

use clap::Parser;
use training::{LoggingSettings, RunConfig, Trainer, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("run failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Train a stacked-LSTM sequence encoder and export its embeddings",
    long_about = None
)]
struct Args {
    /// Directory holding the `train`, `valid` and `test` files.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Line file to embed; selects inference instead of training.
    #[arg(long, value_name = "PATH")]
    infer_path: Option<PathBuf>,

    /// Directory for versioned model snapshots.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: PathBuf,

    /// Output path for per-example normalized embeddings (inference).
    #[arg(long, value_name = "PATH")]
    out_embedding: Option<PathBuf>,

    /// Output path for the normalized softmax weight matrix (training).
    #[arg(long, value_name = "PATH")]
    out_softmax: Option<PathBuf>,

    /// Named hyperparameter preset.
    #[arg(long, default_value = "title", value_name = "title|click")]
    preset: String,

    /// Optional TensorBoard event directory.
    #[arg(long, value_name = "DIR")]
    tensorboard_dir: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = RunConfig::preset(&args.preset)?;
    config.validate()?;

    // Resolve the run mode before anything is constructed.
    enum Mode {
        Train { data_dir: PathBuf, out_softmax: PathBuf },
        Infer { infer_path: PathBuf, out_embedding: PathBuf },
    }

    let mode = match (&args.infer_path, &args.data_dir) {
        (Some(_), Some(_)) => {
            return Err(TrainingError::validation(vec![
                "--infer-path and --data-dir are mutually exclusive".to_string(),
            ]))
        }
        (Some(infer_path), None) => {
            let out_embedding = args.out_embedding.clone().ok_or_else(|| {
                TrainingError::validation(vec![
                    "--out-embedding is required for inference".to_string(),
                ])
            })?;
            Mode::Infer {
                infer_path: infer_path.clone(),
                out_embedding,
            }
        }
        (None, Some(data_dir)) => {
            let out_softmax = args.out_softmax.clone().ok_or_else(|| {
                TrainingError::validation(vec![
                    "--out-softmax is required for training".to_string(),
                ])
            })?;
            Mode::Train {
                data_dir: data_dir.clone(),
                out_softmax,
            }
        }
        (None, None) => {
            return Err(TrainingError::validation(vec![
                "either --data-dir or --infer-path must be given".to_string(),
            ]))
        }
    };

    let logging = LoggingSettings {
        enable_stdout: true,
        tensorboard_dir: args.tensorboard_dir.clone(),
        flush_every_n: 20,
    };
    let mut trainer = Trainer::new(config, &args.checkpoint_dir, logging)?;

    match mode {
        Mode::Train {
            data_dir,
            out_softmax,
        } => trainer.train(&data_dir, &out_softmax),
        Mode::Infer {
            infer_path,
            out_embedding,
        } => trainer.infer(&infer_path, &out_embedding),
    }
}
