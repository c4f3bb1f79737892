pub mod momentum;
pub mod rmsprop;
pub mod scheduler;

pub use momentum::Momentum;
pub use rmsprop::RmsProp;
pub use scheduler::{Constant, ExponentialDecay, LRScheduler};

use std::collections::HashMap;

use crate::model::{GradientMap, ParamMap};
use crate::tensor::{Result, Tensor, TensorError};

/// Applies averaged gradients to the parameters owned by the orchestrator.
///
/// Optimizers keep per-parameter slots (accumulators, velocities) keyed by parameter id, so the
/// same key must always refer to the same parameter.
pub trait Optimizer: Send {
    /// Updates a single parameter in place.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`] if `param` and `grad` differ in shape, or if the
    /// parameter changed size since its slots were created.
    fn update(&mut self, key: &str, param: &mut Tensor<f32, 1>, grad: &Tensor<f32, 1>, lr: f32) -> Result<()>;

    /// Updates every parameter that has a gradient. Parameters without one are left untouched.
    fn step(&mut self, params: &mut ParamMap, grads: &GradientMap, lr: f32) -> Result<()> {
        if let Some(key) = grads.keys().find(|k| !params.contains_key(*k)) {
            return Err(TensorError::Unsupported(format!(
                "gradient for unknown parameter `{key}`"
            )));
        }
        for (key, param) in params.iter_mut() {
            if let Some(grad) = grads.get(key) {
                self.update(key, param, grad, lr)?;
            }
        }
        Ok(())
    }

    /// Per-parameter state keyed `<param>/<slot>`, for checkpoints.
    fn slots(&self) -> ParamMap {
        ParamMap::new()
    }

    /// Restores state produced by [`Optimizer::slots`]. Entries for unknown slots are ignored.
    fn load_slots(&mut self, _slots: &ParamMap) {}
}

pub(crate) fn check_shapes(param: &Tensor<f32, 1>, grad: &Tensor<f32, 1>) -> Result<()> {
    if param.shape() != grad.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: param.shape().to_vec(),
            got: grad.shape().to_vec(),
        });
    }
    Ok(())
}

/// Returns the slot for `key`, creating it filled with `init` on first use.
pub(crate) fn slot<'a>(
    slots: &'a mut HashMap<String, Vec<f32>>,
    key: &str,
    size: usize,
    init: f32,
) -> Result<&'a mut Vec<f32>> {
    let slot = slots
        .entry(key.to_string())
        .or_insert_with(|| vec![init; size]);
    if slot.len() != size {
        return Err(TensorError::ShapeMismatch {
            expected: vec![slot.len()],
            got: vec![size],
        });
    }
    Ok(slot)
}

/// Adds every slot in `slots` to `out` as `<param>/<name>`.
pub(crate) fn export_slots(slots: &HashMap<String, Vec<f32>>, name: &str, out: &mut ParamMap) {
    for (key, values) in slots {
        out.insert(format!("{key}/{name}"), Tensor::from(values.clone()));
    }
}

/// Inverse of [`export_slots`]: loads every `<param>/<name>` entry of `saved` into `slots`.
pub(crate) fn import_slots(slots: &mut HashMap<String, Vec<f32>>, name: &str, saved: &ParamMap) {
    for (key, tensor) in saved {
        if let Some((param, slot_name)) = key.rsplit_once('/') {
            if slot_name == name {
                slots.insert(param.to_string(), tensor.data().to_vec());
            }
        }
    }
}
