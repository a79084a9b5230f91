use ndarray::{Array2, ArrayView1, ArrayView3, Axis};
use rand::{Rng, RngCore};

use crate::{MlErr, Result};

/// A set of code vectors conditioning frames snap to.
///
/// Usage is counted between refreshes so dead codes can be re-seeded from recent frames.
#[derive(Debug, Clone)]
pub struct Codebook {
    codes: Array2<f32>,
    usage: Vec<u64>,
    recent: Vec<Vec<f32>>,
}

impl Codebook {
    /// Creates a new zeroed `Codebook`.
    ///
    /// # Arguments
    /// * `n_codes` - The number of code vectors.
    /// * `dim` - The dimension of each code vector.
    pub fn new(n_codes: usize, dim: usize) -> Self {
        Self {
            codes: Array2::zeros((n_codes, dim)),
            usage: vec![0; n_codes],
            recent: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.nrows() == 0
    }

    pub fn codes(&self) -> &Array2<f32> {
        &self.codes
    }

    /// Overwrites the codes with `values`, row major, as stored by a checkpoint.
    ///
    /// Usage counts and recently seen frames start over.
    pub fn restore(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.codes.len() {
            return Err(MlErr::SizeMismatch {
                what: "codebook",
                got: values.len(),
                expected: self.codes.len(),
            });
        }

        self.codes
            .iter_mut()
            .zip(values)
            .for_each(|(c, v)| *c = *v);
        self.usage.fill(0);
        self.recent.clear();
        Ok(())
    }

    /// Seeds the codes with the first distinct frames of `frames`, `(B, M, F)` tensors.
    ///
    /// # Returns
    /// How many codes were seeded.
    pub fn init<'a, I>(&mut self, frames: I) -> usize
    where
        I: IntoIterator<Item = ArrayView3<'a, f32>>,
    {
        let mut seeded = 0;

        'outer: for mel in frames {
            for item in mel.axis_iter(Axis(0)) {
                for frame in item.axis_iter(Axis(1)) {
                    if seeded == self.len() {
                        break 'outer;
                    }

                    let duplicate = self
                        .codes
                        .axis_iter(Axis(0))
                        .take(seeded)
                        .any(|code| code == frame);

                    if !duplicate {
                        self.codes.row_mut(seeded).assign(&frame);
                        seeded += 1;
                    }
                }
            }
        }

        self.usage.fill(0);
        seeded
    }

    /// The index of the code closest to `frame`.
    pub fn nearest(&self, frame: ArrayView1<f32>) -> usize {
        let mut best = (0, f32::INFINITY);

        for (i, code) in self.codes.axis_iter(Axis(0)).enumerate() {
            let dist: f32 = code
                .iter()
                .zip(frame.iter())
                .map(|(c, f)| (c - f).powi(2))
                .sum();

            if dist < best.1 {
                best = (i, dist);
            }
        }

        best.0
    }

    /// Returns the index of the code closest to `frame` and counts its usage.
    pub fn quantize(&mut self, frame: ArrayView1<f32>) -> usize {
        let best = self.nearest(frame);

        if let Some(count) = self.usage.get_mut(best) {
            *count += 1;
        }

        if self.recent.len() < self.len() {
            self.recent.push(frame.to_vec());
        } else if !self.recent.is_empty() {
            let slot = (self.usage.iter().sum::<u64>() as usize) % self.recent.len();
            self.recent[slot] = frame.to_vec();
        }

        best
    }

    /// The fraction of codes used since the last init or refresh.
    pub fn usage_fraction(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }

        self.usage.iter().filter(|&&u| u > 0).count() as f32 / self.len() as f32
    }

    /// Re-seeds every unused code from a random recently seen frame.
    ///
    /// # Returns
    /// How many codes were replaced.
    pub fn refresh(&mut self, rng: &mut dyn RngCore) -> usize {
        let mut replaced = 0;

        for (i, used) in self.usage.iter().enumerate() {
            if *used > 0 || self.recent.is_empty() {
                continue;
            }

            let frame = &self.recent[rng.random_range(0..self.recent.len())];
            self.codes
                .row_mut(i)
                .iter_mut()
                .zip(frame)
                .for_each(|(c, f)| *c = *f);
            replaced += 1;
        }

        self.usage.fill(0);
        replaced
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn init_skips_duplicate_frames() {
        let mel = Array3::from_shape_vec((1, 2, 3), vec![0., 0., 1., 0., 0., 1.]).unwrap();
        let mut cb = Codebook::new(4, 2);

        assert_eq!(cb.init([mel.view()]), 2);
        assert_eq!(cb.codes().row(1), array![1., 1.]);
    }

    #[test]
    fn refresh_replaces_dead_codes() {
        let mut cb = Codebook::new(2, 1);
        let mel = Array3::from_shape_vec((1, 1, 2), vec![0., 10.]).unwrap();
        cb.init([mel.view()]);

        assert_eq!(cb.quantize(array![0.2].view()), 0);
        assert_eq!(cb.usage_fraction(), 0.5);
        assert_eq!(cb.refresh(&mut StdRng::seed_from_u64(0)), 1);
        assert_eq!(cb.codes().row(1), array![0.2]);
    }

    #[test]
    fn restore_checks_the_size() {
        let mut cb = Codebook::new(2, 2);
        assert!(cb.restore(&[1., 2., 3.]).is_err());

        cb.restore(&[1., 2., 3., 4.]).unwrap();
        assert_eq!(cb.codes().row(1), array![3., 4.]);
        assert_eq!(cb.usage_fraction(), 0.0);
    }
}
