//! The multi-replica training loop.
//!
//! ```text
//! Initializing -> Running -> (Validating | Checkpointing)* -> Stopped
//!                    \-> Diverged
//! ```
//!
//! Each step fans one batch out to every replica, waits for all of them, averages their
//! gradients, checks the loss, applies the update, and then handles logging, validation and
//! checkpointing. Parameters are only written here, between two barriers.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::state::{ParameterAverages, TrainingSnapshot, TrainingState};
use crate::checkpoint::{Checkpoint, CheckpointWriter, load_checkpoint, restore_matching};
use crate::config::TrainingConfig;
use crate::data::QueuePipeline;
use crate::distributed::{ReplicaPool, average_gradients};
use crate::error::{ConfigError, TrainError, TrainResult};
use crate::model::{GradientMap, Model, ParamMap, parameter_count};
use crate::optim::{ExponentialDecay, LRScheduler, Optimizer};

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The precomputed step budget was used up.
    MaxSteps,
    /// The training pipeline ran dry or signalled that it should stop.
    InputExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub steps_run: u64,
    /// Index of the last completed step.
    pub final_step: Option<u64>,
    pub stop_reason: StopReason,
    /// Checkpoints written during the run, in order.
    pub checkpoints: Vec<PathBuf>,
    pub snapshot: TrainingSnapshot,
}

pub struct Trainer<M: Model, O: Optimizer> {
    config: TrainingConfig,
    model: M,
    optimizer: O,
    schedule: Box<dyn LRScheduler>,
    train: QueuePipeline,
    validation: Option<QueuePipeline>,
    replicas: ReplicaPool,
    params: ParamMap,
    averages: ParameterAverages,
    state: TrainingState,
    max_steps: u64,
}

impl<M: Model, O: Optimizer> Trainer<M, O> {
    /// Validates the configuration, initializes parameters (restoring matching ones from
    /// `restore_from` if set) and builds the replica pool. Pipelines are started by [`Trainer::run`]
    /// unless already running.
    pub fn new(
        config: TrainingConfig,
        model: M,
        mut optimizer: O,
        train: QueuePipeline,
        validation: Option<QueuePipeline>,
    ) -> TrainResult<Self> {
        config.validate()?;
        if train.config().batch_size != config.batch_size {
            return Err(ConfigError::invalid_value(
                "batch_size",
                format!(
                    "training pipeline produces batches of {}, config says {}",
                    train.config().batch_size,
                    config.batch_size
                ),
            )
            .into());
        }

        for pipeline in std::iter::once(&train).chain(validation.as_ref()) {
            if pipeline.item_shape() != config.item_shape {
                return Err(ConfigError::invalid_value(
                    "item_shape",
                    format!(
                        "pipeline `{}` loads items of shape {:?}, config says {:?}",
                        pipeline.name(),
                        pipeline.item_shape(),
                        config.item_shape
                    ),
                )
                .into());
            }
        }

        let mut params = model.init_parameters(config.seed);
        let averages = match &config.restore_from {
            Some(path) => {
                let checkpoint = load_checkpoint(path)?;
                let restored = restore_matching(&mut params, &checkpoint);
                optimizer.load_slots(&checkpoint.slots);
                info!(
                    path = %path.display(),
                    step = checkpoint.step,
                    restored,
                    total = params.len(),
                    slots = checkpoint.slots.len(),
                    "restored pretrained parameters"
                );
                ParameterAverages::resume(config.parameter_average_decay, checkpoint.averages, &params)
            }
            None => ParameterAverages::new(config.parameter_average_decay, &params),
        };

        let max_steps = config.max_steps(train.config().examples_per_epoch);
        let schedule = Box::new(ExponentialDecay::new(
            config.initial_learning_rate,
            config.decay_factor,
            config.decay_steps,
        ));
        let state = TrainingState::new(
            config.initial_learning_rate,
            config.loss_average_decay,
            config.validation_average_decay,
        );

        Ok(Self {
            averages,
            replicas: ReplicaPool::new(config.replica_count)?,
            config,
            model,
            optimizer,
            schedule,
            train,
            validation,
            params,
            state,
            max_steps,
        })
    }

    /// Replaces the staircase learning-rate schedule.
    pub fn with_scheduler(mut self, schedule: impl LRScheduler + 'static) -> Self {
        self.schedule = Box::new(schedule);
        self
    }

    /// Caps the run at `max_steps` instead of the value derived from the epoch settings.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    pub fn state(&self) -> TrainingSnapshot {
        self.state.snapshot()
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn averages(&self) -> &ParameterAverages {
        &self.averages
    }

    pub fn train_pipeline(&self) -> &QueuePipeline {
        &self.train
    }

    /// Runs until `max_steps`, input exhaustion, or the first fatal error.
    ///
    /// Both pipelines are stopped and pending checkpoints are flushed before this returns, on
    /// success and on error.
    pub fn run(&mut self) -> TrainResult<TrainingSummary> {
        let writer = CheckpointWriter::new(&self.config.train_dir, self.config.max_checkpoints_to_keep)?;
        let outcome = self.run_loop(&writer);

        self.stop_pipelines();
        let written = writer.finish();

        let (steps_run, final_step, stop_reason) = outcome?;
        let checkpoints = written?;
        let snapshot = self.state.snapshot();
        info!(
            steps = steps_run,
            reason = ?stop_reason,
            checkpoints = checkpoints.len(),
            "training finished"
        );
        Ok(TrainingSummary {
            steps_run,
            final_step,
            stop_reason,
            checkpoints,
            snapshot,
        })
    }

    fn run_loop(&mut self, writer: &CheckpointWriter) -> TrainResult<(u64, Option<u64>, StopReason)> {
        self.start_pipelines()?;
        info!(
            max_steps = self.max_steps,
            replicas = self.replicas.len(),
            batch_size = self.config.batch_size,
            parameters = parameter_count(&self.params),
            "training started"
        );

        let mut steps_run = 0;
        let mut last_step = None;
        let mut last_checkpoint = None;

        let reason = loop {
            let step = self.state.global_step;
            if step >= self.max_steps {
                break StopReason::MaxSteps;
            }

            let started = Instant::now();
            let outputs: Vec<_> = self
                .replicas
                .train_step(&self.model, &self.params, &self.train)?
                .into_iter()
                .flatten()
                .collect();
            if outputs.is_empty() {
                break StopReason::InputExhausted;
            }
            if outputs.len() < self.replicas.len() {
                debug!(step, active = outputs.len(), "partial step at end of input");
            }

            let lanes = outputs.len() as f32;
            let loss = outputs.iter().map(|o| o.loss).sum::<f32>() / lanes;
            let accuracy = outputs.iter().map(|o| o.accuracy).sum::<f32>() / lanes;
            let examples: usize = outputs.iter().map(|o| o.examples).sum();

            if loss.is_nan() {
                error!(step, "Model diverged with loss = NaN");
                return Err(TrainError::Diverged { step });
            }

            let grads: Vec<GradientMap> = outputs.into_iter().map(|o| o.gradients).collect();
            let averaged = average_gradients(&grads)?;

            let lr = self.schedule.get_lr(step);
            self.state.learning_rate = lr;
            self.optimizer.step(&mut self.params, &averaged, lr)?;
            self.averages.update(&self.params, step);
            self.state.record_step(loss, accuracy, examples);
            steps_run += 1;
            last_step = Some(step);

            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                step,
                loss,
                accuracy,
                examples_per_sec = examples as f64 / elapsed,
                sec_per_batch = elapsed / lanes as f64,
                lr,
                "train"
            );

            if step % self.config.validate_every == 0 {
                self.validate(step)?;
            }

            let is_last = step + 1 >= self.max_steps;
            if is_last || (step > 0 && step % self.config.checkpoint_every == 0) {
                self.checkpoint(writer, step)?;
                last_checkpoint = Some(step);
            }

            if self.train.should_stop() {
                break StopReason::InputExhausted;
            }
        };

        if reason == StopReason::InputExhausted {
            if let Some(step) = last_step.filter(|&s| last_checkpoint != Some(s)) {
                self.checkpoint(writer, step)?;
            }
        }
        Ok((steps_run, last_step, reason))
    }

    fn validate(&mut self, step: u64) -> TrainResult<()> {
        let Some(pipeline) = &self.validation else {
            return Ok(());
        };
        let outputs: Vec<_> = self
            .replicas
            .eval_step(&self.model, &self.params, pipeline)?
            .into_iter()
            .flatten()
            .collect();
        if outputs.is_empty() {
            debug!(step, "validation input exhausted");
            return Ok(());
        }

        let accuracy = outputs.iter().map(|o| o.accuracy as f64).sum::<f64>() / outputs.len() as f64;
        let smoothed = self.state.validation_average.update(accuracy);
        info!(step, accuracy, smoothed, "validation");
        Ok(())
    }

    fn checkpoint(&self, writer: &CheckpointWriter, step: u64) -> TrainResult<()> {
        debug!(step, "scheduling checkpoint");
        let checkpoint = Checkpoint::new(step, self.params.clone())
            .with_averages(self.averages.shadow().clone())
            .with_slots(self.optimizer.slots());
        writer.submit(checkpoint)?;
        Ok(())
    }

    fn start_pipelines(&self) -> TrainResult<()> {
        for pipeline in std::iter::once(&self.train).chain(self.validation.as_ref()) {
            if !pipeline.is_started() {
                pipeline.start(self.config.worker_count)?;
            }
        }
        Ok(())
    }

    fn stop_pipelines(&self) {
        for pipeline in std::iter::once(&self.train).chain(self.validation.as_ref()) {
            if pipeline.is_started() {
                if let Err(e) = pipeline.stop() {
                    warn!(pipeline = pipeline.name(), error = %e, "failed to stop pipeline");
                }
            }
        }
    }
}
