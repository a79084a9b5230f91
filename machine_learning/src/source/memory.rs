use std::{f32::consts::TAU, num::NonZeroUsize, path::PathBuf, sync::Arc};

use ndarray::{Array1, Array2, Array3, Axis, stack};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{BatchIter, BatchSource, FEATURES, HOP, ShardSpec, frame_features};
use crate::{Batch, MlErr, Result, RunPosition};

/// A source holding one epoch of batches in memory, replayed for `epochs` epochs.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    batches: Arc<[Batch]>,
    epochs: usize,
    sample_rate: u32,
}

/// Shape of a synthetic source of sine tones.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSpec {
    pub batches: usize,
    pub batch_size: NonZeroUsize,
    pub window: usize,
    pub epochs: usize,
    pub sample_rate: u32,
    pub seed: u64,
}

impl InMemorySource {
    /// Creates a new `InMemorySource`.
    ///
    /// # Arguments
    /// * `batches` - One epoch of batches, their positions are rewritten on iteration.
    /// * `epochs` - How many times the epoch is replayed.
    /// * `sample_rate` - The sample rate of the signals.
    ///
    /// # Returns
    /// A new `InMemorySource` instance.
    pub fn new(batches: Vec<Batch>, epochs: usize, sample_rate: u32) -> Self {
        Self {
            batches: Arc::from(batches),
            epochs,
            sample_rate,
        }
    }

    /// Builds a source of random sine tones, deterministic for a given seed.
    ///
    /// # Returns
    /// The source or a `SizeMismatch` if the window isn't a multiple of `HOP`.
    pub fn synthetic(spec: SyntheticSpec) -> Result<Self> {
        if spec.window == 0 || spec.window % HOP != 0 {
            return Err(MlErr::SizeMismatch {
                what: "window (multiple of hop)",
                got: spec.window,
                expected: spec.window.div_ceil(HOP).max(1) * HOP,
            });
        }

        let mut rng = StdRng::seed_from_u64(spec.seed);
        let items = spec.batch_size.get();
        let frames = spec.window / HOP;

        let batches = (0..spec.batches)
            .map(|b| {
                let tones: Vec<Array1<f32>> = (0..items)
                    .map(|_| {
                        let freq = rng.random_range(80.0..800.0_f32);
                        let amp = rng.random_range(0.2..0.9_f32);
                        Array1::from_shape_fn(spec.window, |t| {
                            amp * (TAU * freq * t as f32 / spec.sample_rate as f32).sin()
                        })
                    })
                    .collect();

                let mels: Vec<Array2<f32>> = tones
                    .iter()
                    .map(|w| frame_features(w.as_slice().unwrap_or_default(), HOP))
                    .collect();

                let wav = stack(Axis(0), &tones.iter().map(|t| t.view()).collect::<Vec<_>>())
                    .map_err(|_| MlErr::EmptyBatch)?;
                let mel = stack(Axis(0), &mels.iter().map(|m| m.view()).collect::<Vec<_>>())
                    .map_err(|_| MlErr::EmptyBatch)?;
                let paths = (0..items)
                    .map(|i| PathBuf::from(format!("synthetic-{b}-{i}.wav")))
                    .collect();

                debug_assert_eq!(mel.dim(), (items, FEATURES, frames));

                Batch::new(
                    wav,
                    mel,
                    Array1::from_shape_fn(items, |i| i as u32),
                    Array2::zeros((items, frames)),
                    RunPosition::new(0, b),
                    paths,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(batches, spec.epochs, spec.sample_rate))
    }
}

impl BatchSource for InMemorySource {
    fn batches_per_epoch(&self) -> usize {
        self.batches.len()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn shard(&self, shard: ShardSpec, start: RunPosition) -> BatchIter {
        let batches_per_epoch = self.batches.len();

        Box::new(ShardIter {
            batches: Arc::clone(&self.batches),
            shard,
            epochs: self.epochs,
            epoch: start.epoch,
            next: shard.first_owned_from(start.batch, batches_per_epoch),
        })
    }
}

struct ShardIter {
    batches: Arc<[Batch]>,
    shard: ShardSpec,
    epochs: usize,
    epoch: usize,
    next: Option<usize>,
}

impl Iterator for ShardIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batches_per_epoch = self.batches.len();

        while self.epoch < self.epochs {
            match self.next {
                Some(index) => {
                    self.next = self.shard.first_owned_from(index + 1, batches_per_epoch);

                    let mut batch = self.batches[index].clone();
                    batch.position = RunPosition::new(self.epoch, index);
                    return Some(Ok(batch));
                }
                None => {
                    self.epoch += 1;
                    self.next = self.shard.first_owned_from(0, batches_per_epoch);
                }
            }
        }

        None
    }
}
