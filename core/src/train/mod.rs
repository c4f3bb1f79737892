//! Training orchestration: state, moving averages and the replica loop.

pub mod state;
pub mod trainer;

pub use state::{ExponentialMovingAverage, ParameterAverages, TrainingSnapshot, TrainingState};
pub use trainer::{StopReason, Trainer, TrainingSummary};
