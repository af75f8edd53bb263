//! Flat-file artifact export.
//!
//! Softmax weights: one line per vocabulary id, tab-separated id and
//! comma-separated column values, ids in order. Embedding rows: one
//! comma-joined vector per input example.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::TrainingError;

/// Writes the column-normalized softmax matrix, `rows[id]` being vocabulary
/// id's H-dimensional vector.
pub fn write_softmax_weights(path: &Path, rows: &[Vec<f32>]) -> Result<(), TrainingError> {
    let file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!(
            "cannot create softmax export file {}: {err}",
            path.display()
        ))
    })?;
    let mut writer = BufWriter::new(file);
    for (id, row) in rows.iter().enumerate() {
        writeln!(writer, "{}\t{}", id, join_values(row))?;
    }
    writer.flush()?;
    Ok(())
}

/// Streaming writer for per-example embedding rows, in input order.
pub struct EmbeddingWriter {
    writer: BufWriter<File>,
    rows: usize,
}

impl EmbeddingWriter {
    pub fn create(path: &Path) -> Result<Self, TrainingError> {
        let file = File::create(path).map_err(|err| {
            TrainingError::runtime(format!(
                "cannot create embedding export file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            rows: 0,
        })
    }

    pub fn push_row(&mut self, row: &[f32]) -> Result<(), TrainingError> {
        writeln!(self.writer, "{}", join_values(row))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> Result<usize, TrainingError> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

fn join_values(values: &[f32]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
