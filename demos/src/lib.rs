//! Reference model for the `train_pairs` binary.
//!
//! [`LinearRanker`] pools each `[H, W, C]` item into per-channel mean and standard deviation
//! (`2C` features) and scores every group with its own linear head:
//!
//! ```text
//! s[b, g] = sum_k W[g, k] * f[b, k]
//! ```
//!
//! A per-group bias would cancel out of every score difference, so there is none.

use aquila::error::{TrainError, TrainResult};
use aquila::loss::{pairwise_accuracy, ranknet_loss, ranknet_loss_and_grad};
use aquila::{GradientMap, Model, ParamMap, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const WEIGHTS: &str = "ranker/weights";

/// Forward pass output kept around for the backward pass.
#[derive(Debug, Clone)]
pub struct RankerPrediction {
    /// `[B, 2C]` pooled features.
    pub features: Tensor<f32, 2>,
    /// `[B, G]` scores.
    pub scores: Tensor<f32, 2>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearRanker {
    groups: usize,
    channels: usize,
}

impl LinearRanker {
    pub fn new(groups: usize, channels: usize) -> Self {
        Self { groups, channels }
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn feature_dim(&self) -> usize {
        2 * self.channels
    }

    fn weights<'a>(&self, params: &'a ParamMap) -> TrainResult<&'a [f32]> {
        let w = params
            .get(WEIGHTS)
            .ok_or_else(|| TrainError::model(format!("missing parameter `{WEIGHTS}`")))?;
        if w.size() != self.groups * self.feature_dim() {
            return Err(TrainError::model(format!(
                "`{WEIGHTS}` has {} values, expected {}",
                w.size(),
                self.groups * self.feature_dim()
            )));
        }
        Ok(w.data())
    }

    /// Per-channel mean and standard deviation of every item.
    fn pool(&self, items: &Tensor<f32, 4>) -> TrainResult<Tensor<f32, 2>> {
        let [b, h, w, c] = *items.shape();
        if c != self.channels {
            return Err(TrainError::model(format!(
                "items have {c} channels, ranker expects {}",
                self.channels
            )));
        }
        let pixels = (h * w).max(1) as f32;
        let dim = self.feature_dim();
        let mut features = Tensor::<f32, 2>::zeros([b, dim]);

        for (item, out) in items
            .data()
            .chunks(h * w * c)
            .zip(features.data_mut().chunks_mut(dim))
        {
            let (mean, var) = out.split_at_mut(c);
            for px in item.chunks(c) {
                for (m, v) in mean.iter_mut().zip(px) {
                    *m += v;
                }
            }
            mean.iter_mut().for_each(|m| *m /= pixels);
            for px in item.chunks(c) {
                for ((s, v), m) in var.iter_mut().zip(px).zip(mean.iter()) {
                    *s += (v - m) * (v - m);
                }
            }
            var.iter_mut().for_each(|s| *s = (*s / pixels).sqrt());
        }
        Ok(features)
    }
}

impl Model for LinearRanker {
    type Prediction = RankerPrediction;

    fn init_parameters(&self, seed: u64) -> ParamMap {
        let mut rng = StdRng::seed_from_u64(seed);
        // Xavier initialization
        let fan = (self.feature_dim() + 1) as f32;
        let scale = (6.0 / fan).sqrt();
        let data: Vec<f32> = (0..self.groups * self.feature_dim())
            .map(|_| rng.random_range(-scale..scale))
            .collect();
        let mut params = ParamMap::new();
        params.insert(WEIGHTS.to_string(), Tensor::from(data));
        params
    }

    fn infer(&self, params: &ParamMap, items: &Tensor<f32, 4>) -> TrainResult<RankerPrediction> {
        let weights = self.weights(params)?;
        let features = self.pool(items)?;
        let [b, dim] = *features.shape();

        let mut scores = Tensor::<f32, 2>::zeros([b, self.groups]);
        for (f, s) in features
            .data()
            .chunks(dim)
            .zip(scores.data_mut().chunks_mut(self.groups))
        {
            for (g, out) in s.iter_mut().enumerate() {
                *out = weights[g * dim..(g + 1) * dim]
                    .iter()
                    .zip(f)
                    .map(|(w, x)| w * x)
                    .sum();
            }
        }
        Ok(RankerPrediction { features, scores })
    }

    fn loss(
        &self,
        prediction: &RankerPrediction,
        labels: &Tensor<f32, 3>,
        conf: &Tensor<f32, 3>,
    ) -> TrainResult<f32> {
        Ok(ranknet_loss(&prediction.scores, labels, conf)?)
    }

    fn accuracy(&self, prediction: &RankerPrediction, labels: &Tensor<f32, 3>) -> TrainResult<f32> {
        Ok(pairwise_accuracy(&prediction.scores, labels)?)
    }

    fn gradients(
        &self,
        _params: &ParamMap,
        prediction: &RankerPrediction,
        labels: &Tensor<f32, 3>,
        conf: &Tensor<f32, 3>,
    ) -> TrainResult<GradientMap> {
        let (_, d_scores) = ranknet_loss_and_grad(&prediction.scores, labels, conf)?;
        let dim = self.feature_dim();

        // dW[g, k] = sum_b dS[b, g] * f[b, k]
        let mut d_weights = vec![0.0f32; self.groups * dim];
        for (f, ds) in prediction
            .features
            .data()
            .chunks(dim)
            .zip(d_scores.data().chunks(self.groups))
        {
            for (g, d) in ds.iter().enumerate() {
                for (acc, x) in d_weights[g * dim..(g + 1) * dim].iter_mut().zip(f) {
                    *acc += d * x;
                }
            }
        }

        let mut grads = GradientMap::new();
        grads.insert(WEIGHTS.to_string(), Tensor::from(d_weights));
        Ok(grads)
    }
}
