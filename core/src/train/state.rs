//! Training state owned by the orchestrator's control loop.
//!
//! The loop is the only writer. Everything else reads a [`TrainingSnapshot`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::ParamMap;

/// Scalar exponential moving average. The first update seeds the value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialMovingAverage {
    decay: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(decay: f64) -> Self {
        Self { decay, value: None }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            Some(v) => self.decay * v + (1.0 - self.decay) * x,
            None => x,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }
}

/// Shadow copy of every parameter, averaged after each update.
///
/// The effective decay at step `t` is `min(decay, (1 + t) / (10 + t))`, so early steps track
/// the raw parameters closely.
#[derive(Debug, Clone)]
pub struct ParameterAverages {
    decay: f32,
    shadow: ParamMap,
}

impl ParameterAverages {
    pub fn new(decay: f32, params: &ParamMap) -> Self {
        Self {
            decay,
            shadow: params.clone(),
        }
    }

    /// Resumes from previously saved averages. Parameters missing from `shadow` start from
    /// their current value.
    pub fn resume(decay: f32, mut shadow: ParamMap, params: &ParamMap) -> Self {
        shadow.retain(|k, v| params.get(k).is_some_and(|p| p.shape() == v.shape()));
        for (key, param) in params {
            shadow.entry(key.clone()).or_insert_with(|| param.clone());
        }
        Self { decay, shadow }
    }

    pub fn effective_decay(&self, step: u64) -> f32 {
        let warmup = (1.0 + step as f64) / (10.0 + step as f64);
        self.decay.min(warmup as f32)
    }

    pub fn update(&mut self, params: &ParamMap, step: u64) {
        let d = self.effective_decay(step);
        self.shadow.par_iter_mut().for_each(|(key, avg)| {
            if let Some(param) = params.get(key) {
                avg.data_mut()
                    .iter_mut()
                    .zip(param.data())
                    .for_each(|(a, &p)| *a = d * *a + (1.0 - d) * p);
            }
        });
    }

    pub fn shadow(&self) -> &ParamMap {
        &self.shadow
    }
}

/// Read-only view of the training state at the end of a step.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    /// Steps completed.
    pub global_step: u64,
    pub learning_rate: f32,
    pub loss: f32,
    pub accuracy: f32,
    pub smoothed_loss: f64,
    pub smoothed_accuracy: f64,
    pub validation_accuracy: Option<f64>,
    pub examples_seen: u64,
}

/// Mutable state of a run.
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub global_step: u64,
    pub learning_rate: f32,
    pub last_loss: f32,
    pub last_accuracy: f32,
    pub examples_seen: u64,
    pub loss_average: ExponentialMovingAverage,
    pub accuracy_average: ExponentialMovingAverage,
    pub validation_average: ExponentialMovingAverage,
}

impl TrainingState {
    pub fn new(initial_lr: f32, loss_decay: f64, validation_decay: f64) -> Self {
        Self {
            global_step: 0,
            learning_rate: initial_lr,
            last_loss: 0.0,
            last_accuracy: 0.0,
            examples_seen: 0,
            loss_average: ExponentialMovingAverage::new(loss_decay),
            accuracy_average: ExponentialMovingAverage::new(loss_decay),
            validation_average: ExponentialMovingAverage::new(validation_decay),
        }
    }

    /// Folds one completed step into the state and advances the global step.
    pub fn record_step(&mut self, loss: f32, accuracy: f32, examples: usize) {
        self.last_loss = loss;
        self.last_accuracy = accuracy;
        self.loss_average.update(loss as f64);
        self.accuracy_average.update(accuracy as f64);
        self.examples_seen += examples as u64;
        self.global_step += 1;
    }

    pub fn snapshot(&self) -> TrainingSnapshot {
        TrainingSnapshot {
            global_step: self.global_step,
            learning_rate: self.learning_rate,
            loss: self.last_loss,
            accuracy: self.last_accuracy,
            smoothed_loss: self.loss_average.value().unwrap_or_default(),
            smoothed_accuracy: self.accuracy_average.value().unwrap_or_default(),
            validation_accuracy: self.validation_average.value(),
            examples_seen: self.examples_seen,
        }
    }
}
