use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable hyperparameter record for one run mode.
///
/// Constructed once at startup from a named preset; the only mutation ever
/// applied is the test-mode override returned by [`RunConfig::test_overrides`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub vocab_size: usize,
    pub batch_size: usize,
    pub num_steps: usize,
    pub init_scale: f64,
    pub lr: f64,
    pub lr_decay: f64,
    /// Number of leading epochs trained at the base rate before decay starts.
    pub lr_nodecay_step: usize,
    pub keep_prob: f64,
    pub max_grad_norm: f64,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub embedding_size: usize,
    pub max_epoch: usize,
}

impl RunConfig {
    pub fn title() -> Self {
        Self {
            vocab_size: 10_000,
            batch_size: 128,
            num_steps: 30,
            init_scale: 0.05,
            lr: 1.0,
            lr_decay: 0.5,
            lr_nodecay_step: 2,
            keep_prob: 1.0,
            max_grad_norm: 5.0,
            num_layers: 2,
            hidden_size: 128,
            embedding_size: 128,
            max_epoch: 5,
        }
    }

    pub fn click() -> Self {
        Self {
            vocab_size: 40_000,
            batch_size: 256,
            num_steps: 30,
            init_scale: 0.05,
            lr: 1.0,
            lr_decay: 0.5,
            lr_nodecay_step: 3,
            keep_prob: 0.8,
            max_grad_norm: 5.0,
            num_layers: 2,
            hidden_size: 128,
            embedding_size: 128,
            max_epoch: 5,
        }
    }

    pub fn preset(name: &str) -> Result<Self, TrainingError> {
        match name {
            "title" => Ok(Self::title()),
            "click" => Ok(Self::click()),
            other => Err(TrainingError::validation(vec![format!(
                "unknown config preset '{}', expected 'title' or 'click'",
                other
            )])),
        }
    }

    /// Test-mode evaluation runs one token at a time regardless of the
    /// training batch shape.
    pub fn test_overrides(&self) -> Self {
        let mut config = self.clone();
        config.batch_size = 1;
        config.num_steps = 1;
        config
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.num_steps == 0 {
            errors.push("num_steps must be greater than 0".to_string());
        }
        if self.init_scale <= 0.0 {
            errors.push("init_scale must be greater than 0".to_string());
        }
        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            errors.push("lr_decay must be in (0, 1]".to_string());
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            errors.push("keep_prob must be in (0, 1]".to_string());
        }
        if self.max_grad_norm <= 0.0 {
            errors.push("max_grad_norm must be greater than 0".to_string());
        }
        if self.num_layers == 0 {
            errors.push("num_layers must be greater than 0".to_string());
        }
        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.embedding_size == 0 {
            errors.push("embedding_size must be greater than 0".to_string());
        }
        if self.max_epoch == 0 {
            errors.push("max_epoch must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "run failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
