pub mod checkpoint;
pub mod config;
pub mod data;
pub mod export;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod runner;
pub mod schedule;
pub mod trainer;

pub use config::{RunConfig, TrainingError};
pub use data::{Batch, BatchSource, LineBatcher, Vocabulary};
pub use logging::{Logger, LoggingSettings};
pub use metrics::{EpochSummary, PerplexityMeter};
pub use optimizer::GradientDescent;
pub use runner::{run_epoch, EpochOutcome, Session};
pub use schedule::EpochSchedule;
pub use trainer::Trainer;
