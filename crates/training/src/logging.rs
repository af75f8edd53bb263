//! Console and TensorBoard reporting.
//!
//! Console lines are informational, never machine-parsed. The TensorBoard
//! writer emits standard event records: a length-prefixed, masked-CRC32
//! framed protobuf `Event` per scalar.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::TrainingError;

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub flush_every_n: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            flush_every_n: 20,
        }
    }
}

impl LoggingSettings {
    pub fn silent() -> Self {
        Self {
            enable_stdout: false,
            tensorboard_dir: None,
            flush_every_n: 20,
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(dir, settings.flush_every_n)?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn info(&self, message: &str) {
        if self.settings.enable_stdout {
            println!("{message}");
        }
    }

    pub fn log_epoch_learning_rate(&mut self, epoch: usize, lr: f64) {
        if self.settings.enable_stdout {
            println!("epoch {}, learning rate is: {:.3}", epoch, lr);
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("train/learning_rate", epoch as i64, lr);
        }
    }

    pub fn log_progress(&mut self, step: usize, perplexity: f64) {
        if self.settings.enable_stdout {
            println!("  step: {}, perplexity: {:.3}", step, perplexity);
        }
    }

    pub fn log_epoch_perplexity(&mut self, split: &str, epoch: usize, perplexity: f64) {
        if self.settings.enable_stdout {
            println!("Epoch: {}, {} perplexity: {:.3}", epoch, split, perplexity);
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let tag = format!("{}/perplexity", split.to_ascii_lowercase());
            let _ = writer.write_scalar(&tag, epoch as i64, perplexity);
        }
    }

    pub fn log_test_perplexity(&mut self, epoch: usize, perplexity: f64) {
        if self.settings.enable_stdout {
            println!("Test perplexity: {:.3}", perplexity);
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("test/perplexity", epoch as i64, perplexity);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!("events.out.tfevents.{}.{}", unix_timestamp(), hostname());
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };

        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
