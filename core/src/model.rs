//! The boundary between the orchestrator and the network.
//!
//! The orchestrator owns the parameters. Replicas hand the model an immutable `&ParamMap` and
//! get back a prediction and a gradient map; only the orchestrator's update step mutates
//! parameters.

use std::collections::BTreeMap;

use crate::error::TrainResult;
use crate::tensor::Tensor;

/// Parameters keyed by id. Tensors are flattened; the model knows their logical shapes.
pub type ParamMap = BTreeMap<String, Tensor<f32, 1>>;

/// Gradients keyed by parameter id, same layout as [`ParamMap`].
pub type GradientMap = BTreeMap<String, Tensor<f32, 1>>;

/// A pairwise ranking model.
///
/// Implementations must be callable from several replica threads at once.
pub trait Model: Send + Sync {
    /// Whatever the forward pass produces, including anything `gradients` needs.
    type Prediction: Send;

    fn init_parameters(&self, seed: u64) -> ParamMap;

    /// Forward pass over a `[B, H, W, C]` item batch.
    fn infer(&self, params: &ParamMap, items: &Tensor<f32, 4>) -> TrainResult<Self::Prediction>;

    /// Scalar loss against `[B, B, G]` labels and confidences.
    fn loss(
        &self,
        prediction: &Self::Prediction,
        labels: &Tensor<f32, 3>,
        conf: &Tensor<f32, 3>,
    ) -> TrainResult<f32>;

    /// Fraction of supervised pairs ranked correctly.
    fn accuracy(&self, prediction: &Self::Prediction, labels: &Tensor<f32, 3>) -> TrainResult<f32>;

    /// Gradient of [`Model::loss`] with respect to every trainable parameter.
    fn gradients(
        &self,
        params: &ParamMap,
        prediction: &Self::Prediction,
        labels: &Tensor<f32, 3>,
        conf: &Tensor<f32, 3>,
    ) -> TrainResult<GradientMap>;
}

/// Total number of scalar parameters.
pub fn parameter_count(params: &ParamMap) -> usize {
    params.values().map(Tensor::size).sum()
}
