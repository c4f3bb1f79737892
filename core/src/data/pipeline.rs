//! Bounded producer/consumer queue feeding replicas.
//!
//! Each worker thread loops `Idle -> Sampling -> Loading -> Enqueuing -> Idle`. Work is claimed
//! one batch at a time against the epoch target *before* sampling, so the number of examples
//! produced never exceeds the target by more than one batch and nothing is sampled once the
//! target is reached.
//!
//! Every claimed batch ends up in exactly one bucket:
//!
//! ```text
//! claimed = dequeued + dropped + discarded
//! ```
//!
//! `dropped` batches had an item fail to load; `discarded` batches were cancelled by
//! [`QueuePipeline::stop`] before a consumer received them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::{Batch, BatchSampler, ItemId, ItemLoader, PairIndex, SamplerConfig, build_label_matrices};
use crate::error::{DataError, PipelineError, TrainResult};
use crate::tensor::Tensor;

/// One unit of replica work.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// `[B, H, W, C]` item tensors.
    pub items: Tensor<f32, 4>,
    /// `[B, B, G]` labels of the ordered pairs.
    pub labels: Tensor<f32, 3>,
    /// `[B, B, G]` confidences; zero cells carry no supervision.
    pub conf: Tensor<f32, 3>,
    pub ids: Vec<String>,
    /// Unique per pipeline, assigned when the entry is assembled.
    pub sequence: u64,
}

impl QueueEntry {
    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub examples_per_epoch: usize,
    /// Capacity of the queue in entries (whole batches).
    pub queue_capacity: usize,
    /// Default worker count used by [`QueuePipeline::start_default`].
    pub workers: usize,
    pub sampler: SamplerConfig,
    /// Failures after which an item that never loaded becomes fatal. `0` disables the check.
    pub max_item_failures: usize,
    /// How often blocked producers and consumers re-check the cancellation flag.
    pub poll_interval: Duration,
}

impl PipelineConfig {
    pub fn new(batch_size: usize, epochs: usize, examples_per_epoch: usize) -> Self {
        Self {
            batch_size,
            epochs,
            examples_per_epoch,
            queue_capacity: 8,
            workers: 2,
            sampler: SamplerConfig::new(batch_size),
            max_item_failures: 3,
            poll_interval: Duration::from_millis(20),
        }
    }

    /// Examples to produce before the pipeline starts stopping.
    pub fn target_examples(&self) -> u64 {
        self.epochs as u64 * self.examples_per_epoch as u64
    }
}

/// What a producer thread is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Sampling,
    Loading,
    Enqueuing,
    Exited,
}

/// Counter snapshot. See the module docs for how the counters relate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub claimed_batches: u64,
    pub enqueued_batches: u64,
    pub dequeued_batches: u64,
    pub dropped_batches: u64,
    pub discarded_batches: u64,
    pub examples_produced: u64,
}

#[derive(Debug, Default)]
struct ItemHealth {
    failures: usize,
    loaded: bool,
}

#[derive(Default)]
struct Counters {
    claimed: AtomicU64,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    examples: AtomicU64,
}

struct Shared {
    name: String,
    config: PipelineConfig,
    index: Arc<PairIndex>,
    loader: Arc<dyn ItemLoader>,

    claimed_examples: AtomicU64,
    in_flight: AtomicUsize,
    next_sequence: AtomicU64,
    stopping: AtomicBool,
    cancelled: AtomicBool,
    finished: AtomicBool,

    fatal: Mutex<Option<DataError>>,
    health: Mutex<HashMap<ItemId, ItemHealth>>,
    states: Mutex<Vec<WorkerState>>,
    counters: Counters,
}

/// Sampling, loading and queueing for one input stream (training or validation).
pub struct QueuePipeline {
    shared: Arc<Shared>,
    tx: Sender<QueueEntry>,
    rx: Receiver<QueueEntry>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl QueuePipeline {
    /// Fails with [`DataError::InsufficientData`] when the corpus cannot fill one batch.
    pub fn new(
        name: impl Into<String>,
        mut config: PipelineConfig,
        index: Arc<PairIndex>,
        loader: Arc<dyn ItemLoader>,
    ) -> Result<Self, DataError> {
        config.sampler.batch_size = config.batch_size;
        // Validates the corpus size up front; workers build their own samplers on start.
        BatchSampler::new(Arc::clone(&index), config.sampler)?;

        let (tx, rx) = channel::bounded(config.queue_capacity.max(1));
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                index,
                loader,
                claimed_examples: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                next_sequence: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                fatal: Mutex::new(None),
                health: Mutex::new(HashMap::new()),
                states: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
            tx,
            rx,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn index(&self) -> &Arc<PairIndex> {
        &self.shared.index
    }

    /// `[H, W, C]` of every item this pipeline loads.
    pub fn item_shape(&self) -> [usize; 3] {
        self.shared.loader.item_shape()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Starts `config.workers` producers.
    pub fn start_default(&self) -> Result<(), PipelineError> {
        self.start(self.shared.config.workers)
    }

    /// Spawns `workers` producer threads. A pipeline can be started once.
    pub fn start(&self, workers: usize) -> Result<(), PipelineError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyStarted(self.shared.name.clone()));
        }

        let workers = workers.max(1);
        *self.shared.states.lock() = vec![WorkerState::Idle; workers];

        let mut handles = self.workers.lock();
        for worker in 0..workers {
            let mut sampler_config = self.shared.config.sampler;
            sampler_config.seed = sampler_config.seed.wrapping_add(worker as u64);
            let sampler = BatchSampler::new(Arc::clone(&self.shared.index), sampler_config)
                .map_err(|e| self.spawn_error(e.to_string()))?;

            let shared = Arc::clone(&self.shared);
            let tx = self.tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-producer-{worker}", self.shared.name))
                .spawn(move || shared.run_worker(worker, sampler, tx))
                .map_err(|e| self.spawn_error(e.to_string()))?;
            handles.push(handle);
        }

        info!(
            pipeline = %self.shared.name,
            workers,
            target_examples = self.shared.config.target_examples(),
            "input pipeline started"
        );
        Ok(())
    }

    fn spawn_error(&self, message: String) -> PipelineError {
        PipelineError::Spawn {
            name: self.shared.name.clone(),
            message,
        }
    }

    /// Blocks until `n` entries are available or the pipeline is done producing.
    ///
    /// Returns fewer than `n` entries only once the pipeline is stopping; an empty vector means
    /// the input is exhausted. A fatal item access error is returned on the next call.
    pub fn dequeue_many(&self, n: usize) -> TrainResult<Vec<QueueEntry>> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PipelineError::NotStarted(self.shared.name.clone()).into());
        }

        let mut entries = Vec::with_capacity(n);
        while entries.len() < n {
            if let Some(err) = self.shared.fatal.lock().clone() {
                self.shared
                    .counters
                    .discarded
                    .fetch_add(entries.len() as u64, Ordering::SeqCst);
                return Err(err.into());
            }
            match self.rx.try_recv() {
                Ok(entry) => {
                    entries.push(entry);
                    continue;
                }
                Err(_) if self.should_stop() => break,
                Err(_) => {}
            }
            match self.rx.recv_timeout(self.shared.config.poll_interval) {
                Ok(entry) => entries.push(entry),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shared
            .counters
            .dequeued
            .fetch_add(entries.len() as u64, Ordering::SeqCst);
        Ok(entries)
    }

    /// True once the epoch target is reached and fully drained, after [`QueuePipeline::stop`],
    /// or after a fatal error. Never reverts to false.
    pub fn should_stop(&self) -> bool {
        let shared = &self.shared;
        if shared.finished.load(Ordering::SeqCst) {
            return true;
        }
        let done = shared.cancelled.load(Ordering::SeqCst)
            || shared.fatal.lock().is_some()
            || (shared.stopping.load(Ordering::SeqCst)
                && shared.in_flight.load(Ordering::SeqCst) == 0
                && self.rx.is_empty());
        if done {
            shared.finished.store(true, Ordering::SeqCst);
        }
        done
    }

    /// Cancels producers, joins them and releases undelivered entries. Repeat calls are no-ops.
    pub fn stop(&self) -> Result<(), PipelineError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PipelineError::NotStarted(self.shared.name.clone()));
        }

        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.cancelled.store(true, Ordering::SeqCst);

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!(pipeline = %self.shared.name, "producer thread panicked");
            }
        }

        let mut released = 0;
        while self.rx.try_recv().is_ok() {
            released += 1;
        }
        if released > 0 {
            self.shared
                .counters
                .discarded
                .fetch_add(released, Ordering::SeqCst);
        }
        self.shared.finished.store(true, Ordering::SeqCst);
        debug!(pipeline = %self.shared.name, released, "input pipeline stopped");
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            claimed_batches: c.claimed.load(Ordering::SeqCst),
            enqueued_batches: c.enqueued.load(Ordering::SeqCst),
            dequeued_batches: c.dequeued.load(Ordering::SeqCst),
            dropped_batches: c.dropped.load(Ordering::SeqCst),
            discarded_batches: c.discarded.load(Ordering::SeqCst),
            examples_produced: c.examples.load(Ordering::SeqCst),
        }
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.states.lock().clone()
    }

    /// Entries currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for QueuePipeline {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}

impl Shared {
    fn run_worker(&self, worker: usize, mut sampler: BatchSampler, tx: Sender<QueueEntry>) {
        while !self.cancelled.load(Ordering::SeqCst) {
            self.set_state(worker, WorkerState::Idle);
            if !self.claim() {
                break;
            }

            self.set_state(worker, WorkerState::Sampling);
            let batch = sampler.next_batch();

            self.set_state(worker, WorkerState::Loading);
            match self.assemble(&batch) {
                Ok(entry) => {
                    self.set_state(worker, WorkerState::Enqueuing);
                    if self.push(&tx, entry) {
                        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
                        self.counters
                            .examples
                            .fetch_add(batch.len() as u64, Ordering::SeqCst);
                    } else {
                        self.counters.discarded.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(err) => {
                    warn!(pipeline = %self.name, worker, error = %err, "dropping batch");
                    self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.set_state(worker, WorkerState::Exited);
        trace!(pipeline = %self.name, worker, "producer exited");
    }

    /// Reserves one batch worth of examples. `in_flight` is raised before the reservation so a
    /// consumer never sees the pipeline drained while a claimed batch is still being built.
    fn claim(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let target = self.config.target_examples();
        let b = self.config.batch_size as u64;
        let claimed = self
            .claimed_examples
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < target && !self.stopping.load(Ordering::SeqCst)).then_some(c + b)
            });

        match claimed {
            Ok(previous) => {
                self.counters.claimed.fetch_add(1, Ordering::SeqCst);
                if previous + b >= target && !self.stopping.swap(true, Ordering::SeqCst) {
                    info!(pipeline = %self.name, claimed = previous + b, "epoch target reached, stopping");
                }
                true
            }
            Err(_) => {
                self.stopping.store(true, Ordering::SeqCst);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    fn assemble(&self, batch: &Batch) -> Result<QueueEntry, DataError> {
        let mut tensors = Vec::with_capacity(batch.len());
        let mut ids = Vec::with_capacity(batch.len());
        for &id in batch.items() {
            let name = self
                .index
                .item_name(id)
                .ok_or_else(|| DataError::UnknownItem(id.index().to_string()))?;
            match self.loader.load(name) {
                Ok(tensor) => {
                    self.record_success(id);
                    tensors.push(tensor);
                }
                Err(err) => {
                    self.record_failure(id, name, &err);
                    return Err(err);
                }
            }
            ids.push(name.to_string());
        }

        let items = Tensor::stack(&tensors).map_err(|e| DataError::item_load(ids.join(","), e.to_string()))?;
        let (labels, conf) = build_label_matrices(batch, &self.index);
        Ok(QueueEntry {
            items,
            labels,
            conf,
            ids,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn record_success(&self, id: ItemId) {
        self.health.lock().entry(id).or_default().loaded = true;
    }

    fn record_failure(&self, id: ItemId, name: &str, err: &DataError) {
        let mut health = self.health.lock();
        let entry = health.entry(id).or_default();
        entry.failures += 1;

        let limit = self.config.max_item_failures;
        if limit == 0 || entry.loaded || entry.failures < limit {
            return;
        }

        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            error!(pipeline = %self.name, item = name, attempts = entry.failures, "item never loads");
            *fatal = Some(DataError::Access {
                item: name.to_string(),
                attempts: entry.failures,
                message: err.to_string(),
            });
        }
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Blocks on a full queue while polling for cancellation. False when the entry was not
    /// delivered.
    fn push(&self, tx: &Sender<QueueEntry>, mut entry: QueueEntry) -> bool {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            match tx.send_timeout(entry, self.config.poll_interval) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => entry = back,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    fn set_state(&self, worker: usize, state: WorkerState) {
        if let Some(slot) = self.states.lock().get_mut(worker) {
            *slot = state;
        }
    }
}
