//! Batch source: turns a stream of text lines into fixed-shape batches of
//! (source ids, target ids, valid length) triples.

use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{Device, Tensor};

use crate::TrainingError;

pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_TOKEN: &str = "<unk>";
pub const EOS_ID: u32 = 0;
pub const UNK_ID: u32 = 1;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Word → id lookup table. Ids 0 and 1 are reserved for `<eos>` and `<unk>`;
/// the remaining ids are assigned by descending corpus frequency, ties broken
/// lexicographically, so the same file always yields the same table.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    pub fn build_from_file(path: &Path, max_size: usize) -> Result<Self> {
        if max_size <= 2 {
            return Err(TrainingError::initialization(
                "vocabulary size must leave room for the reserved tokens",
            ));
        }

        let file = File::open(path).map_err(|err| {
            TrainingError::initialization(format!(
                "cannot read vocabulary source {}: {err}",
                path.display()
            ))
        })?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        for line in BufReader::new(file).lines() {
            for word in line?.split_whitespace() {
                *counts.entry(word.to_string()).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_size - 2);

        let mut tokens = vec![EOS_TOKEN.to_string(), UNK_TOKEN.to_string()];
        tokens.extend(ranked.into_iter().map(|(word, _)| word));
        Ok(Self::from_tokens(tokens))
    }

    /// Restores the table written by [`Vocabulary::save`], ids by line order.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            TrainingError::initialization(format!(
                "cannot read vocabulary file {}: {err}",
                path.display()
            ))
        })?;
        let mut tokens = Vec::new();
        for line in BufReader::new(file).lines() {
            tokens.push(line?);
        }
        if tokens.len() < 2 {
            return Err(TrainingError::initialization(format!(
                "vocabulary file {} is missing the reserved tokens",
                path.display()
            )));
        }
        Ok(Self::from_tokens(tokens))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path).map_err(|err| {
            TrainingError::runtime(format!(
                "cannot write vocabulary file {}: {err}",
                path.display()
            ))
        })?;
        for token in &self.tokens {
            writeln!(file, "{token}")?;
        }
        Ok(())
    }

    pub fn lookup(&self, word: &str) -> u32 {
        self.index.get(word).copied().unwrap_or(UNK_ID)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn from_tokens(tokens: Vec<String>) -> Self {
        let index = tokens
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id as u32))
            .collect();
        Self { tokens, index }
    }
}

/// One fixed-shape batch. `source` and `target` are `(batch, num_steps)` U32
/// tensors; positions at or beyond `lengths[i]` are padding (id 0) and are
/// masked out of the loss downstream.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source: Tensor,
    pub target: Tensor,
    pub lengths: Vec<usize>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn token_count(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Resettable stream of batches. `Ok(None)` is the end-of-data signal and
/// terminates an epoch normally; it is never an error.
pub trait BatchSource {
    fn reset(&mut self) -> Result<()>;
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

struct Window {
    source: Vec<u32>,
    target: Vec<u32>,
    len: usize,
}

/// File-backed batch source. Each line is whitespace tokenized, mapped
/// through the vocabulary, terminated with `<eos>` and cut into prediction
/// windows of `num_steps` tokens.
pub struct LineBatcher {
    path: PathBuf,
    vocab: Arc<Vocabulary>,
    device: Device,
    batch_size: usize,
    num_steps: usize,
    /// Emit the trailing short batch instead of dropping it. Training and
    /// evaluation require full batches; inference must not lose rows.
    allow_partial: bool,
    reader: Option<BufReader<File>>,
    pending: VecDeque<Window>,
}

impl LineBatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        vocab: Arc<Vocabulary>,
        batch_size: usize,
        num_steps: usize,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch_size must be greater than zero",
            ));
        }
        if num_steps == 0 {
            return Err(TrainingError::initialization(
                "num_steps must be greater than zero",
            ));
        }
        Ok(Self {
            path: path.into(),
            vocab,
            device,
            batch_size,
            num_steps,
            allow_partial: false,
            reader: None,
            pending: VecDeque::new(),
        })
    }

    pub fn with_allow_partial(mut self, allow_partial: bool) -> Self {
        self.allow_partial = allow_partial;
        self
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            TrainingError::runtime("batch source used before reset()")
        })?;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
    }

    fn enqueue_line(&mut self, line: &str) {
        let mut ids: Vec<u32> = line
            .split_whitespace()
            .map(|word| self.vocab.lookup(word))
            .collect();
        if ids.is_empty() {
            return;
        }
        ids.push(EOS_ID);

        // ids[j] predicts ids[j + 1]; windows tile the prediction positions.
        let steps = self.num_steps;
        let positions = ids.len() - 1;
        let mut start = 0;
        while start < positions {
            let len = steps.min(positions - start);
            let mut source = ids[start..start + len].to_vec();
            let mut target = ids[start + 1..start + 1 + len].to_vec();
            source.resize(steps, EOS_ID);
            target.resize(steps, EOS_ID);
            self.pending.push_back(Window {
                source,
                target,
                len,
            });
            start += steps;
        }
    }

    fn materialize(&self, windows: Vec<Window>) -> Result<Batch> {
        let rows = windows.len();
        let steps = self.num_steps;
        let mut source = Vec::with_capacity(rows * steps);
        let mut target = Vec::with_capacity(rows * steps);
        let mut lengths = Vec::with_capacity(rows);
        for window in windows {
            source.extend_from_slice(&window.source);
            target.extend_from_slice(&window.target);
            lengths.push(window.len);
        }

        let source = Tensor::from_vec(source, (rows, steps), &self.device)
            .map_err(to_runtime_error)?;
        let target = Tensor::from_vec(target, (rows, steps), &self.device)
            .map_err(to_runtime_error)?;
        Ok(Batch {
            source,
            target,
            lengths,
        })
    }
}

impl BatchSource for LineBatcher {
    fn reset(&mut self) -> Result<()> {
        let file = File::open(&self.path).map_err(|err| {
            TrainingError::initialization(format!(
                "cannot open data file {}: {err}",
                self.path.display()
            ))
        })?;
        self.reader = Some(BufReader::new(file));
        self.pending.clear();
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        while self.pending.len() < self.batch_size {
            match self.next_line()? {
                Some(line) => self.enqueue_line(&line),
                None => break,
            }
        }

        if self.pending.is_empty() {
            return Ok(None);
        }
        if self.pending.len() < self.batch_size && !self.allow_partial {
            // The remainder cannot fill a batch; the epoch is over.
            self.pending.clear();
            return Ok(None);
        }

        let rows = self.batch_size.min(self.pending.len());
        let windows: Vec<Window> = self.pending.drain(..rows).collect();
        self.materialize(windows).map(Some)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
