//! Pairwise ranking losses.
//!
//! Scores are `[B, G]`: one scalar per item and group. Labels and confidences are the `[B, B, G]`
//! matrices built for the batch. For a cell `(i, j, g)` with confidence `c > 0` the target
//! probability that `i` ranks above `j` is `labels[i, j, g] / c`, and the cell contributes a
//! logistic (RankNet) loss on the score difference `s[i, g] - s[j, g]`, weighted by `c`.
//! Cells with zero confidence are skipped entirely.

use crate::tensor::{Result, Tensor, TensorError};

/// Confidence-weighted mean RankNet loss.
pub fn ranknet_loss(scores: &Tensor<f32, 2>, labels: &Tensor<f32, 3>, conf: &Tensor<f32, 3>) -> Result<f32> {
    ranknet_loss_and_grad(scores, labels, conf).map(|(loss, _)| loss)
}

/// Loss and its gradient with respect to `scores`.
///
/// Uses the stable form `max(x, 0) - x * t + ln(1 + e^{-|x|})` of binary cross-entropy with
/// logits, whose derivative is `sigmoid(x) - t`. Returns a zero loss and gradient when no cell
/// carries confidence.
pub fn ranknet_loss_and_grad(
    scores: &Tensor<f32, 2>,
    labels: &Tensor<f32, 3>,
    conf: &Tensor<f32, 3>,
) -> Result<(f32, Tensor<f32, 2>)> {
    let [b, g] = *scores.shape();
    check_pair_shape(labels, b, g)?;
    check_pair_shape(conf, b, g)?;

    let s = scores.data();
    let (l, c) = (labels.data(), conf.data());
    let mut grad = Tensor::<f32, 2>::zeros([b, g]);
    let mut total = 0.0f64;
    let mut weight = 0.0f64;

    for i in 0..b {
        for j in 0..b {
            if i == j {
                continue;
            }
            for k in 0..g {
                let cell = (i * b + j) * g + k;
                let w = c[cell];
                if w <= 0.0 {
                    continue;
                }
                let t = (l[cell] / w).clamp(0.0, 1.0);
                let x = s[i * g + k] - s[j * g + k];

                total += (w * (x.max(0.0) - x * t + (-x.abs()).exp().ln_1p())) as f64;
                weight += w as f64;

                let d = w * (sigmoid(x) - t);
                grad.data_mut()[i * g + k] += d;
                grad.data_mut()[j * g + k] -= d;
            }
        }
    }

    if weight == 0.0 {
        return Ok((0.0, grad));
    }
    let norm = (1.0 / weight) as f32;
    grad.data_mut().iter_mut().for_each(|v| *v *= norm);
    Ok(((total / weight) as f32, grad))
}

/// Fraction of strictly preferred ordered cells (`labels[i,j,g] > labels[j,i,g]`) where
/// `s[i, g] > s[j, g]`. Zero when the batch holds no strict preference.
pub fn pairwise_accuracy(scores: &Tensor<f32, 2>, labels: &Tensor<f32, 3>) -> Result<f32> {
    let [b, g] = *scores.shape();
    check_pair_shape(labels, b, g)?;

    let (s, l) = (scores.data(), labels.data());
    let mut correct = 0usize;
    let mut total = 0usize;
    for i in 0..b {
        for j in 0..b {
            if i == j {
                continue;
            }
            for k in 0..g {
                if l[(i * b + j) * g + k] > l[(j * b + i) * g + k] {
                    total += 1;
                    if s[i * g + k] > s[j * g + k] {
                        correct += 1;
                    }
                }
            }
        }
    }

    if total == 0 {
        return Ok(0.0);
    }
    Ok(correct as f32 / total as f32)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn check_pair_shape(t: &Tensor<f32, 3>, b: usize, g: usize) -> Result<()> {
    if t.shape() != &[b, b, g] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, b, g],
            got: t.shape().to_vec(),
        });
    }
    Ok(())
}
