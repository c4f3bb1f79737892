use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::error::{TrainError, TrainResult};
use crate::model::GradientMap;
use crate::tensor::{Tensor, TensorError};

/// Element-wise mean of every parameter's gradient across replicas.
///
/// All replicas must report the same parameter ids with the same shapes; anything else is
/// [`TrainError::InconsistentGradientShape`]. Sums run in replica order.
pub fn average_gradients(replicas: &[GradientMap]) -> TrainResult<GradientMap> {
    let Some(first) = replicas.first() else {
        return Err(TrainError::model("no replica gradients to average"));
    };

    for (r, grads) in replicas.iter().enumerate().skip(1) {
        if let Some(key) = first.keys().find(|k| !grads.contains_key(*k)) {
            return Err(TrainError::inconsistent_gradient(
                key.as_str(),
                format!("missing from replica {r}"),
            ));
        }
        for (key, grad) in grads {
            let Some(reference) = first.get(key) else {
                return Err(TrainError::inconsistent_gradient(
                    key.as_str(),
                    format!("reported only by replica {r}"),
                ));
            };
            if grad.shape() != reference.shape() {
                return Err(TrainError::inconsistent_gradient(
                    key.as_str(),
                    format!(
                        "replica 0 has shape {:?}, replica {r} has {:?}",
                        reference.shape(),
                        grad.shape()
                    ),
                ));
            }
        }
    }

    let count = replicas.len() as f32;
    let averaged = first
        .par_iter()
        .map(|(key, g0)| {
            let mut sum = g0.data().to_vec();
            for grads in &replicas[1..] {
                let Some(g) = grads.get(key) else {
                    return Err(TensorError::Unsupported(format!("missing gradient `{key}`")));
                };
                sum.iter_mut().zip(g.data()).for_each(|(s, v)| *s += v);
            }
            sum.iter_mut().for_each(|s| *s /= count);
            Ok((key.clone(), Tensor::new(sum, *g0.shape())?))
        })
        .collect::<Result<BTreeMap<_, _>, TensorError>>()?;
    Ok(averaged)
}
