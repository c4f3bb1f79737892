//! Error types for the training pipeline.
//!
//! ```text
//! TrainError (top-level, returned by the orchestrator)
//! ├── DataError        (corpus parsing, sampling, item access)
//! ├── PipelineError    (queue lifecycle misuse)
//! ├── ConfigError      (validation / file loading)
//! ├── CheckpointError  (safetensors I/O)
//! └── TensorError      (shape and index errors)
//! ```
//!
//! Transient per-sample load failures never show up here: the queue pipeline logs them, drops
//! the batch, and counts it in [`crate::data::PipelineStats`].

use std::path::PathBuf;
use thiserror::Error;

use crate::tensor::TensorError;

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

/// Top-level error type for a training run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// Two replicas reported different parameter sets or shapes for the same parameter.
    #[error("Inconsistent gradient for parameter `{param}`: {detail}")]
    InconsistentGradientShape { param: String, detail: String },

    /// The averaged loss was NaN. Fatal; the run is aborted without checkpointing this step.
    #[error("Model diverged with loss = NaN on step {step}")]
    Diverged { step: u64 },

    /// The model collaborator reported a failure.
    #[error("Model error: {0}")]
    Model(String),

    /// The replica thread pool could not be created.
    #[error("Replica pool error: {0}")]
    ReplicaPool(String),
}

impl TrainError {
    /// Construct a [`TrainError::Model`].
    pub fn model<S: Into<String>>(msg: S) -> Self {
        TrainError::Model(msg.into())
    }

    /// Construct a [`TrainError::InconsistentGradientShape`].
    pub fn inconsistent_gradient<P: Into<String>, S: Into<String>>(param: P, detail: S) -> Self {
        TrainError::InconsistentGradientShape {
            param: param.into(),
            detail: detail.into(),
        }
    }
}

/// Errors produced while loading the corpus or accessing item data.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    /// A corpus record could not be parsed.
    #[error("Malformed record on line {line}: {message}")]
    Format { line: usize, message: String },

    /// A corpus record has the wrong number of label values.
    #[error("Record on line {line} has {found} label values, expected {expected} (2 x groups)")]
    Schema {
        line: usize,
        expected: usize,
        found: usize,
    },

    /// The corpus has fewer distinct items than one batch needs.
    #[error("Corpus has {available} distinct items but a batch needs {required}")]
    InsufficientData { available: usize, required: usize },

    /// An item failed to load on every attempt.
    #[error("Item `{item}` failed to load on all {attempts} attempts: {message}")]
    Access {
        item: String,
        attempts: usize,
        message: String,
    },

    /// A single item load failed. Absorbed by the pipeline unless it keeps happening.
    #[error("Cannot load item `{item}`: {message}")]
    ItemLoad { item: String, message: String },

    /// The corpus file could not be read.
    #[error("Cannot read corpus `{path}`: {message}")]
    Io { path: PathBuf, message: String },

    /// An item name or id is not part of the index.
    #[error("Unknown item `{0}`")]
    UnknownItem(String),
}

impl DataError {
    /// Construct a [`DataError::Format`].
    pub fn format<S: Into<String>>(line: usize, msg: S) -> Self {
        DataError::Format {
            line,
            message: msg.into(),
        }
    }

    /// Construct a [`DataError::ItemLoad`].
    pub fn item_load<I: Into<String>, S: Into<String>>(item: I, msg: S) -> Self {
        DataError::ItemLoad {
            item: item.into(),
            message: msg.into(),
        }
    }

    /// Construct a [`DataError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        DataError::Io {
            path: path.into(),
            message: source.to_string(),
        }
    }
}

/// Lifecycle misuse of a [`crate::data::QueuePipeline`]. Fatal to the caller, not the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Pipeline `{0}` was already started")]
    AlreadyStarted(String),

    #[error("Pipeline `{0}` has not been started")]
    NotStarted(String),

    #[error("Pipeline `{name}` could not spawn a worker: {message}")]
    Spawn { name: String, message: String },
}

/// Errors produced when loading or validating a [`crate::config::TrainingConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors produced while writing or reading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Safetensors error for `{path}`: {message}")]
    Format { path: PathBuf, message: String },

    #[error("Checkpoint `{path}` has no `global_step` metadata")]
    MissingStep { path: PathBuf },

    #[error("Checkpoint writer thread stopped unexpectedly")]
    WriterGone,
}
