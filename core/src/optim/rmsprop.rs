use std::collections::HashMap;

use rayon::prelude::*;

use super::{Optimizer, check_shapes, export_slots, import_slots, slot};
use crate::model::ParamMap;
use crate::tensor::{Result, Tensor};

/// RMSProp with momentum.
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & ms_t = \rho \, ms_{t-1} + (1 - \rho) g_t^2 \\
/// & mom_t = \mu \, mom_{t-1} + \eta \, g_t / \sqrt{ms_t + \epsilon} \\
/// & \theta_t = \theta_{t-1} - mom_t
/// \end{aligned}
/// $$
///
/// The mean-square slot starts at one and the momentum slot at zero.
#[derive(Debug, Clone)]
pub struct RmsProp {
    pub decay: f32,
    pub momentum: f32,
    pub epsilon: f32,
    mean_square: HashMap<String, Vec<f32>>,
    velocity: HashMap<String, Vec<f32>>,
}

impl RmsProp {
    pub fn new(decay: f32, momentum: f32, epsilon: f32) -> Self {
        Self {
            decay,
            momentum,
            epsilon,
            mean_square: HashMap::new(),
            velocity: HashMap::new(),
        }
    }
}

impl Default for RmsProp {
    fn default() -> Self {
        Self::new(0.9, 0.9, 1.0)
    }
}

impl Optimizer for RmsProp {
    fn update(&mut self, key: &str, param: &mut Tensor<f32, 1>, grad: &Tensor<f32, 1>, lr: f32) -> Result<()> {
        check_shapes(param, grad)?;
        let size = param.size();
        let ms = slot(&mut self.mean_square, key, size, 1.0)?;
        let mom = slot(&mut self.velocity, key, size, 0.0)?;

        let (rho, mu, eps) = (self.decay, self.momentum, self.epsilon);
        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(ms.par_iter_mut())
            .zip(mom.par_iter_mut())
            .for_each(|(((p, &g), ms), mom)| {
                *ms = rho * *ms + (1.0 - rho) * g * g;
                *mom = mu * *mom + lr * g / (*ms + eps).sqrt();
                *p -= *mom;
            });
        Ok(())
    }

    fn slots(&self) -> ParamMap {
        let mut out = ParamMap::new();
        export_slots(&self.mean_square, "rms", &mut out);
        export_slots(&self.velocity, "momentum", &mut out);
        out
    }

    fn load_slots(&mut self, slots: &ParamMap) {
        import_slots(&mut self.mean_square, "rms", slots);
        import_slots(&mut self.velocity, "momentum", slots);
    }
}
