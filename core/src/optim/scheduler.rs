//! Learning Rate Schedulers.

/// A trait for learning rate schedulers.
pub trait LRScheduler: Send + Sync {
    /// Calculates the learning rate for a given global step.
    fn get_lr(&self, step: u64) -> f32;
}

/// Exponential decay.
///
/// `lr = initial_lr * decay_rate^(step / decay_steps)`, with the exponent floored when
/// `staircase` is set so the rate drops in discrete steps every `decay_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub initial_lr: f32,
    pub decay_rate: f32,
    pub decay_steps: u64,
    pub staircase: bool,
}

impl ExponentialDecay {
    /// A staircase schedule.
    pub fn new(initial_lr: f32, decay_rate: f32, decay_steps: u64) -> Self {
        Self {
            initial_lr,
            decay_rate,
            decay_steps,
            staircase: true,
        }
    }

    pub fn continuous(mut self) -> Self {
        self.staircase = false;
        self
    }
}

impl LRScheduler for ExponentialDecay {
    fn get_lr(&self, step: u64) -> f32 {
        if self.decay_steps == 0 {
            return self.initial_lr;
        }
        let exponent = if self.staircase {
            (step / self.decay_steps) as f64
        } else {
            step as f64 / self.decay_steps as f64
        };
        (self.initial_lr as f64 * (self.decay_rate as f64).powf(exponent)) as f32
    }
}

/// Fixed learning rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant(pub f32);

impl LRScheduler for Constant {
    fn get_lr(&self, _step: u64) -> f32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staircase_decay() {
        let scheduler = ExponentialDecay::new(0.05, 0.16, 10_000);

        assert_eq!(scheduler.get_lr(0), 0.05);
        assert_eq!(scheduler.get_lr(9_999), 0.05);
        assert!((scheduler.get_lr(10_000) - 0.05 * 0.16).abs() < 1e-7);

        let expected = 0.05f64 * 0.16f64.powi(2);
        assert!((scheduler.get_lr(25_000) as f64 - expected).abs() < 1e-8);
    }

    #[test]
    fn test_continuous_decay() {
        let scheduler = ExponentialDecay::new(1.0, 0.5, 10).continuous();
        assert!((scheduler.get_lr(5) - 0.5f32.sqrt()).abs() < 1e-6);
        assert!((scheduler.get_lr(20) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_zero_decay_steps_is_constant() {
        let scheduler = ExponentialDecay::new(0.1, 0.5, 0);
        assert_eq!(scheduler.get_lr(1_000_000), 0.1);
        assert_eq!(Constant(0.3).get_lr(7), 0.3);
    }
}
