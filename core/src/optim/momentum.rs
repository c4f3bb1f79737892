use std::collections::HashMap;

use rayon::prelude::*;

use super::{Optimizer, check_shapes, export_slots, import_slots, slot};
use crate::model::ParamMap;
use crate::tensor::{Result, Tensor};

/// Heavy-ball SGD.
///
/// Updates parameters using the rule:
/// `velocity = momentum * velocity + grad; param = param - lr * velocity`
#[derive(Debug, Clone)]
pub struct Momentum {
    pub momentum: f32,
    velocity: HashMap<String, Vec<f32>>,
}

impl Momentum {
    pub fn new(momentum: f32) -> Self {
        Self {
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for Momentum {
    fn update(&mut self, key: &str, param: &mut Tensor<f32, 1>, grad: &Tensor<f32, 1>, lr: f32) -> Result<()> {
        check_shapes(param, grad)?;
        let velocity = slot(&mut self.velocity, key, param.size(), 0.0)?;
        let mu = self.momentum;

        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(velocity.par_iter_mut())
            .for_each(|((p, &g), v)| {
                *v = mu * *v + g;
                *p -= lr * *v;
            });
        Ok(())
    }

    fn slots(&self) -> ParamMap {
        let mut out = ParamMap::new();
        export_slots(&self.velocity, "momentum", &mut out);
        out
    }

    fn load_slots(&mut self, slots: &ParamMap) {
        import_slots(&mut self.velocity, "momentum", slots);
    }
}
