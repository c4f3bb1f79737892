//! Training configuration.
//!
//! [`TrainingConfig`] holds every hyper-parameter and infrastructure setting of a run. It
//! round-trips through JSON; missing fields take their defaults, which reproduce the reference
//! setup (4 replicas of 16 items, RMSProp with staircase learning-rate decay).
//!
//! # Example
//!
//! ```rust
//! use aquila::config::TrainingConfig;
//!
//! let cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//! assert_eq!(cfg.global_batch_size(), 64);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::{PipelineConfig, SamplerConfig};
use crate::error::ConfigError;

/// Complete configuration for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------
    /// Items per replica batch (B). Default: **16**.
    pub batch_size: usize,
    /// Parallel replicas (R). Default: **4**.
    pub replica_count: usize,
    /// Passes over `examples_per_epoch`. Default: **50**.
    pub epoch_count: usize,
    /// Examples in one epoch. Defaults to the number of items in the training corpus.
    pub examples_per_epoch: Option<usize>,

    // -----------------------------------------------------------------------
    // Optimization
    // -----------------------------------------------------------------------
    /// Default: **0.05**.
    pub initial_learning_rate: f32,
    /// Multiplier applied every `decay_steps`. Default: **0.16**.
    pub decay_factor: f32,
    /// Default: **10000**.
    pub decay_steps: u64,
    /// Default: **0.9**.
    pub rmsprop_decay: f32,
    /// Default: **0.9**.
    pub momentum: f32,
    /// Default: **1.0**.
    pub epsilon: f32,

    // -----------------------------------------------------------------------
    // Moving averages
    // -----------------------------------------------------------------------
    /// Smoothing for the reported loss and accuracy. Default: **0.995**.
    pub loss_average_decay: f64,
    /// Smoothing for validation accuracy. Default: **0.95**.
    pub validation_average_decay: f64,
    /// Decay of the parameter shadow copy. Default: **0.9999**.
    pub parameter_average_decay: f32,

    // -----------------------------------------------------------------------
    // Schedule
    // -----------------------------------------------------------------------
    /// Steps between checkpoints. Default: **10000**.
    pub checkpoint_every: u64,
    /// Steps between validation passes. Default: **100**.
    pub validate_every: u64,
    /// Default: **20**.
    pub max_checkpoints_to_keep: usize,

    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------
    /// Queue capacity in batches. Defaults to two per replica.
    pub queue_capacity: Option<usize>,
    /// Producer threads per pipeline. Default: **2**.
    pub worker_count: usize,
    /// Label groups (G). Default: **9**.
    pub num_groups: usize,
    /// `[H, W, C]` of every item. Default: **[299, 299, 3]**.
    pub item_shape: [usize; 3],
    pub sample_with_replacement: bool,
    /// Failures after which an item that never loaded aborts the run. Default: **3**.
    pub max_item_failures: usize,
    pub seed: u64,

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------
    /// Checkpoint directory. Default: `train`.
    pub train_dir: PathBuf,
    /// Checkpoint whose matching parameters seed the model before step 0.
    pub restore_from: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            replica_count: 4,
            epoch_count: 50,
            examples_per_epoch: None,
            initial_learning_rate: 0.05,
            decay_factor: 0.16,
            decay_steps: 10_000,
            rmsprop_decay: 0.9,
            momentum: 0.9,
            epsilon: 1.0,
            loss_average_decay: 0.995,
            validation_average_decay: 0.95,
            parameter_average_decay: 0.9999,
            checkpoint_every: 10_000,
            validate_every: 100,
            max_checkpoints_to_keep: 20,
            queue_capacity: None,
            worker_count: 2,
            num_groups: 9,
            item_shape: [299, 299, 3],
            sample_with_replacement: false,
            max_item_failures: 3,
            seed: 0,
            train_dir: PathBuf::from("train"),
            restore_from: None,
        }
    }
}

impl TrainingConfig {
    /// Items consumed per step across all replicas (B x R).
    pub fn global_batch_size(&self) -> usize {
        self.batch_size * self.replica_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(2 * self.replica_count)
    }

    /// `floor(examples_per_epoch / (B x R) x epochs)`.
    pub fn max_steps(&self, examples_per_epoch: usize) -> u64 {
        let global = self.global_batch_size().max(1) as f64;
        (examples_per_epoch as f64 / global * self.epoch_count as f64).floor() as u64
    }

    /// Pipeline settings for `epochs` passes over `examples_per_epoch` examples.
    pub fn pipeline_config(&self, epochs: usize, examples_per_epoch: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            epochs,
            examples_per_epoch,
            queue_capacity: self.queue_capacity(),
            workers: self.worker_count,
            sampler: SamplerConfig {
                batch_size: self.batch_size,
                with_replacement: self.sample_with_replacement,
                seed: self.seed,
            },
            max_item_failures: self.max_item_failures,
            poll_interval: Duration::from_millis(20),
        }
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened and
    /// [`ConfigError::ParseError`] if the JSON is malformed.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save as pretty-printed JSON, creating parent directories.
    pub fn to_json_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check that every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size < 2 {
            return Err(ConfigError::invalid_value("batch_size", "must be >= 2"));
        }
        if self.replica_count == 0 {
            return Err(ConfigError::invalid_value("replica_count", "must be > 0"));
        }
        if self.epoch_count == 0 {
            return Err(ConfigError::invalid_value("epoch_count", "must be > 0"));
        }
        if self.examples_per_epoch == Some(0) {
            return Err(ConfigError::invalid_value("examples_per_epoch", "must be > 0"));
        }
        if !(self.initial_learning_rate > 0.0 && self.initial_learning_rate.is_finite()) {
            return Err(ConfigError::invalid_value(
                "initial_learning_rate",
                format!("must be a positive finite number, got {}", self.initial_learning_rate),
            ));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(ConfigError::invalid_value(
                "decay_factor",
                format!("must be in (0, 1], got {}", self.decay_factor),
            ));
        }
        if self.decay_steps == 0 {
            return Err(ConfigError::invalid_value("decay_steps", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.rmsprop_decay) {
            return Err(ConfigError::invalid_value("rmsprop_decay", "must be in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::invalid_value("momentum", "must be in [0, 1)"));
        }
        if self.epsilon <= 0.0 {
            return Err(ConfigError::invalid_value("epsilon", "must be > 0"));
        }
        for (field, decay) in [
            ("loss_average_decay", self.loss_average_decay),
            ("validation_average_decay", self.validation_average_decay),
            ("parameter_average_decay", self.parameter_average_decay as f64),
        ] {
            if !(0.0..1.0).contains(&decay) {
                return Err(ConfigError::invalid_value(field, format!("must be in [0, 1), got {decay}")));
            }
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::invalid_value("checkpoint_every", "must be > 0"));
        }
        if self.validate_every == 0 {
            return Err(ConfigError::invalid_value("validate_every", "must be > 0"));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::invalid_value("queue_capacity", "must be > 0"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid_value("worker_count", "must be > 0"));
        }
        if self.num_groups == 0 {
            return Err(ConfigError::invalid_value("num_groups", "must be > 0"));
        }
        if self.item_shape.contains(&0) {
            return Err(ConfigError::invalid_value(
                "item_shape",
                format!("all dimensions must be > 0, got {:?}", self.item_shape),
            ));
        }
        Ok(())
    }
}
