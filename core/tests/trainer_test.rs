use std::path::Path;
use std::sync::Arc;

use aquila::checkpoint::{Checkpoint, list_checkpoints, load_checkpoint, save_checkpoint};
use aquila::data::{ItemLoader, PairIndex, QueuePipeline, SyntheticItemLoader};
use aquila::optim::{Constant, ExponentialDecay, Momentum};
use aquila::{
    GradientMap, Model, ParamMap, StopReason, Tensor, TrainError, TrainResult, Trainer, TrainingConfig,
};

/// Every replica reports the same gradient. `nan_at` makes the loss NaN once `w[0]` reaches it.
struct FixedGradient {
    grad: Vec<f32>,
    nan_at: Option<f32>,
}

impl FixedGradient {
    fn new(grad: Vec<f32>) -> Self {
        Self { grad, nan_at: None }
    }
}

impl Model for FixedGradient {
    type Prediction = f32;

    fn init_parameters(&self, _seed: u64) -> ParamMap {
        let mut params = ParamMap::new();
        params.insert("w".into(), Tensor::from(vec![0.0; self.grad.len()]));
        params
    }

    fn infer(&self, params: &ParamMap, items: &Tensor<f32, 4>) -> TrainResult<f32> {
        assert_eq!(items.shape()[0], 2);
        Ok(params["w"].data()[0])
    }

    fn loss(&self, w0: &f32, _labels: &Tensor<f32, 3>, _conf: &Tensor<f32, 3>) -> TrainResult<f32> {
        match self.nan_at {
            Some(limit) if *w0 >= limit - 1e-4 => Ok(f32::NAN),
            _ => Ok(1.0),
        }
    }

    fn accuracy(&self, _w0: &f32, _labels: &Tensor<f32, 3>) -> TrainResult<f32> {
        Ok(0.5)
    }

    fn gradients(
        &self,
        _params: &ParamMap,
        _w0: &f32,
        _labels: &Tensor<f32, 3>,
        _conf: &Tensor<f32, 3>,
    ) -> TrainResult<GradientMap> {
        let mut grads = GradientMap::new();
        grads.insert("w".into(), Tensor::from(self.grad.clone()));
        Ok(grads)
    }
}

fn ring(n: usize) -> Arc<PairIndex> {
    let mut builder = PairIndex::builder(2);
    for i in 0..n {
        builder
            .add_pair(&format!("x{i}"), &format!("x{}", (i + 1) % n), &[1.0, 0.0], &[0.0, 1.0])
            .unwrap();
    }
    Arc::new(builder.build())
}

fn config(dir: &Path) -> TrainingConfig {
    TrainingConfig {
        batch_size: 2,
        replica_count: 2,
        epoch_count: 1,
        examples_per_epoch: Some(8),
        num_groups: 2,
        item_shape: [2, 2, 1],
        checkpoint_every: 1000,
        validate_every: 1000,
        train_dir: dir.to_path_buf(),
        ..TrainingConfig::default()
    }
}

fn pipeline(name: &str, config: &TrainingConfig, epochs: usize, items: usize) -> QueuePipeline {
    let loader: Arc<dyn ItemLoader> = Arc::new(SyntheticItemLoader::new(config.item_shape));
    QueuePipeline::new(name, config.pipeline_config(epochs, items), ring(items), loader).unwrap()
}

fn steps(dir: &Path) -> Vec<u64> {
    list_checkpoints(dir).unwrap().into_iter().map(|(s, _)| s).collect()
}

#[test]
fn test_update_uses_the_average_of_replica_gradients() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.replica_count = 4;
    let train = pipeline("train", &config, 100, 16);

    let mut trainer = Trainer::new(config, FixedGradient::new(vec![1.0, -2.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_scheduler(Constant(0.1))
        .with_max_steps(5);
    let summary = trainer.run().unwrap();

    assert_eq!(summary.stop_reason, StopReason::MaxSteps);
    assert_eq!(summary.steps_run, 5);
    // Averaging four identical gradients gives the gradient back; summing would give 4x.
    let w = trainer.params()["w"].data();
    assert!((w[0] + 0.5).abs() < 1e-5, "w = {w:?}");
    assert!((w[1] - 1.0).abs() < 1e-5, "w = {w:?}");
    assert_eq!(summary.snapshot.examples_seen, 5 * 4 * 2);
}

#[test]
fn test_learning_rate_follows_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let train = pipeline("train", &config, 100, 16);

    // Steps 0 and 1 at 1.0, steps 2 and 3 at 0.5.
    let mut trainer = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_scheduler(ExponentialDecay::new(1.0, 0.5, 2))
        .with_max_steps(4);
    let summary = trainer.run().unwrap();

    assert!((trainer.params()["w"].data()[0] + 3.0).abs() < 1e-5);
    assert!((summary.snapshot.learning_rate - 0.5).abs() < 1e-7);
}

#[test]
fn test_final_step_is_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let train = pipeline("train", &config, 100, 16);

    let mut trainer = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_max_steps(5);
    let summary = trainer.run().unwrap();

    assert_eq!(summary.final_step, Some(4));
    assert_eq!(summary.checkpoints.len(), 1);
    assert_eq!(steps(dir.path()), vec![4]);

    let checkpoint = load_checkpoint(&summary.checkpoints[0]).unwrap();
    assert_eq!(checkpoint.step, 4);
    assert_eq!(&checkpoint.params["w"], &trainer.params()["w"]);
    assert!(checkpoint.averages.contains_key("w"));
    assert_eq!(checkpoint.slots["w/momentum"].data(), &[1.0]);
}

#[test]
fn test_periodic_checkpoints_skip_step_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.checkpoint_every = 2;
    let train = pipeline("train", &config, 100, 16);

    let mut trainer = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_max_steps(6);
    trainer.run().unwrap();

    assert_eq!(steps(dir.path()), vec![2, 4, 5]);
}

#[test]
fn test_single_step_run_is_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let train = pipeline("train", &config(dir.path()), 100, 16);

    let mut trainer = Trainer::new(config(dir.path()), FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_scheduler(Constant(0.05))
        .with_max_steps(1);
    let summary = trainer.run().unwrap();

    assert_eq!(summary.steps_run, 1);
    assert_eq!(summary.final_step, Some(0));
    assert_eq!(steps(dir.path()), vec![0]);
    let checkpoint = load_checkpoint(&summary.checkpoints[0]).unwrap();
    assert_eq!(checkpoint.params["w"].data(), &[-0.05]);
}

#[test]
fn test_input_exhausted_after_first_step_is_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    // Four examples: two batches, one step of two replicas.
    let train = pipeline("train", &config, 1, 4);

    let mut trainer = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_max_steps(100);
    let summary = trainer.run().unwrap();

    assert_eq!(summary.stop_reason, StopReason::InputExhausted);
    assert_eq!(summary.final_step, Some(0));
    assert_eq!(steps(dir.path()), vec![0]);
}

#[test]
fn test_nan_loss_aborts_before_the_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.checkpoint_every = 1;
    let train = pipeline("train", &config, 100, 16);

    // w[0] grows by one per step, so the loss turns NaN on step 3.
    let model = FixedGradient {
        grad: vec![-1.0],
        nan_at: Some(3.0),
    };
    let mut trainer = Trainer::new(config, model, Momentum::new(0.0), train, None)
        .unwrap()
        .with_scheduler(Constant(1.0))
        .with_max_steps(100);
    let err = trainer.run().unwrap_err();

    assert!(matches!(err, TrainError::Diverged { step: 3 }), "{err}");
    assert_eq!(steps(dir.path()), vec![1, 2]);
    assert_eq!(trainer.params()["w"].data(), &[3.0]);
    assert!(trainer.train_pipeline().should_stop());
}

#[test]
fn test_run_ends_when_input_is_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    // One epoch of 8 examples: four batches, two steps of two replicas.
    let train = pipeline("train", &config, 1, 8);

    let mut trainer = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .unwrap()
        .with_max_steps(100);
    let summary = trainer.run().unwrap();

    assert_eq!(summary.stop_reason, StopReason::InputExhausted);
    assert_eq!(summary.steps_run, 2);
    assert_eq!(summary.final_step, Some(1));
    assert_eq!(steps(dir.path()), vec![1]);
}

#[test]
fn test_max_steps_derive_from_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.epoch_count = 3;
    config.examples_per_epoch = Some(10);
    // floor(10 / (2 x 2) x 3) = 7
    let train = pipeline("train", &config, 3, 10);
    let trainer = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None).unwrap();
    assert_eq!(trainer.max_steps(), 7);
}

#[test]
fn test_validation_is_smoothed_into_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.validate_every = 2;
    let train = pipeline("train", &config, 100, 16);
    let validation = pipeline("validation", &config, 100, 8);

    let mut trainer = Trainer::new(
        config,
        FixedGradient::new(vec![1.0]),
        Momentum::new(0.0),
        train,
        Some(validation),
    )
    .unwrap()
    .with_max_steps(5);
    let summary = trainer.run().unwrap();

    let validation = summary.snapshot.validation_accuracy.unwrap();
    assert!((validation - 0.5).abs() < 1e-9);
    assert!((summary.snapshot.smoothed_accuracy - 0.5).abs() < 1e-9);
}

#[test]
fn test_matching_parameters_are_restored() {
    let dir = tempfile::tempdir().unwrap();
    let pretrained = tempfile::tempdir().unwrap();
    let mut saved = ParamMap::new();
    saved.insert("w".into(), Tensor::from(vec![5.0, 6.0]));
    saved.insert("other".into(), Tensor::from(vec![1.0]));
    let mut averages = ParamMap::new();
    averages.insert("w".into(), Tensor::from(vec![4.5, 5.5]));
    let path = save_checkpoint(pretrained.path(), &Checkpoint::new(40, saved).with_averages(averages)).unwrap();

    let mut config = config(dir.path());
    config.restore_from = Some(path);
    let train = pipeline("train", &config, 100, 16);
    let trainer = Trainer::new(config, FixedGradient::new(vec![0.0, 0.0]), Momentum::new(0.0), train, None).unwrap();

    assert_eq!(trainer.params()["w"].data(), &[5.0, 6.0]);
    assert!(!trainer.params().contains_key("other"));
    assert_eq!(trainer.averages().shadow()["w"].data(), &[4.5, 5.5]);
}

#[test]
fn test_batch_size_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mut other = config.clone();
    other.batch_size = 4;
    let train = pipeline("train", &other, 1, 16);

    let err = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::Config(_)));
}

#[test]
fn test_item_shape_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let mut other = config.clone();
    other.item_shape = [4, 4, 3];
    let loader: Arc<dyn ItemLoader> = Arc::new(SyntheticItemLoader::new(other.item_shape));
    let train = QueuePipeline::new("train", config.pipeline_config(1, 16), ring(16), loader).unwrap();

    let err = Trainer::new(config, FixedGradient::new(vec![1.0]), Momentum::new(0.0), train, None)
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::Config(_)), "{err}");
}
