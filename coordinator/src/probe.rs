use machine_learning::model::{Parameter, l2_norm};
use rayon::prelude::*;

/// The extremes of the update to weight ratio across parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateRatio {
    pub min: f32,
    pub max: f32,
}

/// A copy of the parameters taken right before an optimizer step.
///
/// Lives for one reporting iteration: captured before the step and consumed by `finish` after it.
#[derive(Debug)]
pub struct ProgressProbe {
    before: Vec<Vec<f32>>,
}

impl ProgressProbe {
    pub fn capture(params: &[Parameter]) -> Self {
        Self {
            before: params.par_iter().map(|p| p.value().to_vec()).collect(),
        }
    }

    /// Computes `|after - before| / |before|` for every parameter and keeps the extremes.
    ///
    /// A parameter whose norm was zero reports `0` when it didn't move and infinity otherwise.
    ///
    /// # Arguments
    /// * `params` - The same parameters, in the same order, after the step.
    pub fn finish(self, params: &[Parameter]) -> UpdateRatio {
        if self.before.is_empty() {
            return UpdateRatio { min: 0.0, max: 0.0 };
        }

        let (min, max) = self
            .before
            .par_iter()
            .zip(params.par_iter())
            .map(|(before, after)| {
                let delta: Vec<f32> = after
                    .value()
                    .iter()
                    .zip(before)
                    .map(|(a, b)| a - b)
                    .collect();

                let update = l2_norm(&delta);
                let weight = l2_norm(before);
                let ratio = match (update, weight) {
                    (u, _) if u == 0.0 => 0.0,
                    (_, w) if w == 0.0 => f32::INFINITY,
                    (u, w) => u / w,
                };

                (ratio, ratio)
            })
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );

        UpdateRatio { min, max }
    }
}
