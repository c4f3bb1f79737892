use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::trace;

use crate::data::QueuePipeline;
use crate::error::{TrainError, TrainResult};
use crate::model::{GradientMap, Model, ParamMap};

/// What one replica reports back to the barrier after a training step.
#[derive(Debug, Clone)]
pub struct ReplicaOutput {
    pub replica: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub gradients: GradientMap,
    pub examples: usize,
}

/// Result of a forward-only validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutput {
    pub replica: usize,
    pub accuracy: f32,
    pub examples: usize,
}

/// One compute lane. Holds no state between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub id: usize,
}

impl Replica {
    /// Dequeues one batch and computes loss, accuracy and gradients. `None` when the pipeline
    /// is exhausted.
    pub fn train<M: Model>(
        &self,
        model: &M,
        params: &ParamMap,
        pipeline: &QueuePipeline,
    ) -> TrainResult<Option<ReplicaOutput>> {
        let Some(entry) = pipeline.dequeue_many(1)?.pop() else {
            return Ok(None);
        };
        trace!(replica = self.id, sequence = entry.sequence, "replica step");

        let prediction = model.infer(params, &entry.items)?;
        let loss = model.loss(&prediction, &entry.labels, &entry.conf)?;
        let accuracy = model.accuracy(&prediction, &entry.labels)?;
        let gradients = model.gradients(params, &prediction, &entry.labels, &entry.conf)?;
        Ok(Some(ReplicaOutput {
            replica: self.id,
            loss,
            accuracy,
            gradients,
            examples: entry.batch_size(),
        }))
    }

    /// Forward pass and accuracy only.
    pub fn evaluate<M: Model>(
        &self,
        model: &M,
        params: &ParamMap,
        pipeline: &QueuePipeline,
    ) -> TrainResult<Option<EvalOutput>> {
        let Some(entry) = pipeline.dequeue_many(1)?.pop() else {
            return Ok(None);
        };
        let prediction = model.infer(params, &entry.items)?;
        Ok(Some(EvalOutput {
            replica: self.id,
            accuracy: model.accuracy(&prediction, &entry.labels)?,
            examples: entry.batch_size(),
        }))
    }
}

/// `R` replicas on a dedicated thread pool with one thread per replica.
pub struct ReplicaPool {
    pool: ThreadPool,
    replicas: Vec<Replica>,
}

impl ReplicaPool {
    pub fn new(count: usize) -> TrainResult<Self> {
        let count = count.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(|i| format!("replica-{i}"))
            .build()
            .map_err(|e| TrainError::ReplicaPool(e.to_string()))?;
        Ok(Self {
            pool,
            replicas: (0..count).map(|id| Replica { id }).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Runs every replica in parallel and waits for all of them: this is the barrier.
    ///
    /// Outputs come back in replica order. Replicas that found the pipeline exhausted report
    /// `None`. The first error from any replica is returned.
    pub fn train_step<M: Model>(
        &self,
        model: &M,
        params: &ParamMap,
        pipeline: &QueuePipeline,
    ) -> TrainResult<Vec<Option<ReplicaOutput>>> {
        self.pool.install(|| {
            self.replicas
                .par_iter()
                .map(|replica| replica.train(model, params, pipeline))
                .collect()
        })
    }

    /// Validation pass on every replica.
    pub fn eval_step<M: Model>(
        &self,
        model: &M,
        params: &ParamMap,
        pipeline: &QueuePipeline,
    ) -> TrainResult<Vec<Option<EvalOutput>>> {
        self.pool.install(|| {
            self.replicas
                .par_iter()
                .map(|replica| replica.evaluate(model, params, pipeline))
                .collect()
        })
    }
}
