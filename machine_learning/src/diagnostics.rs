use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::{MlErr, Result};

/// Softmax over the class axis of `(B, Q, N)` logits.
pub fn softmax(logits: ArrayView3<f32>) -> Array3<f32> {
    let mut probs = logits.to_owned();

    for mut lane in probs.lanes_mut(Axis(1)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }

    probs
}

/// The mean probability the model assigns to the target class.
///
/// # Arguments
/// * `logits` - `(B, Q, N)` class scores.
/// * `target` - `(B, N)` target classes.
///
/// # Returns
/// The average over every `(b, n)` of `softmax(logits)[b, target[b, n], n]`.
pub fn avg_prob_target(logits: ArrayView3<f32>, target: ArrayView2<usize>) -> Result<f32> {
    let (b, q, n) = logits.dim();
    if target.dim() != (b, n) {
        return Err(MlErr::SizeMismatch {
            what: "target",
            got: target.len(),
            expected: b * n,
        });
    }

    if b * n == 0 {
        return Err(MlErr::EmptyBatch);
    }

    let probs = softmax(logits);
    let mut total = 0.0;

    for ((i, j), &class) in target.indexed_iter() {
        if class >= q {
            return Err(MlErr::SizeMismatch {
                what: "target class",
                got: class,
                expected: q,
            });
        }
        total += probs[[i, class, j]];
    }

    Ok(total / (b * n) as f32)
}

/// The mean of the highest class probability of every prediction.
pub fn avg_max(logits: ArrayView3<f32>) -> f32 {
    let probs = softmax(logits);
    let peaks: Array2<f32> = probs.fold_axis(Axis(1), f32::NEG_INFINITY, |m, &x| m.max(x));
    peaks.mean().unwrap_or(0.0)
}
