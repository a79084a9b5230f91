use std::path::PathBuf;

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// Where iteration stands inside a run: the epoch and the batch index within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunPosition {
    pub epoch: usize,
    pub batch: usize,
}

impl RunPosition {
    /// Creates a new `RunPosition`.
    ///
    /// # Arguments
    /// * `epoch` - The epoch index.
    /// * `batch` - The batch index within the epoch.
    ///
    /// # Returns
    /// A new `RunPosition` instance.
    pub fn new(epoch: usize, batch: usize) -> Self {
        Self { epoch, batch }
    }

    /// The run-wide step for this position, `batches_per_epoch * epoch + batch`.
    ///
    /// # Arguments
    /// * `batches_per_epoch` - How many batches the source yields per epoch.
    ///
    /// # Returns
    /// The global step.
    pub fn global_step(self, batches_per_epoch: usize) -> u64 {
        (batches_per_epoch * self.epoch + self.batch) as u64
    }
}

/// The memory space a batch lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Host,
    Accelerator(usize),
}

/// One unit of training input.
///
/// Shapes, with `B` items per batch:
/// * `wav` - `(B, T)` raw signal in `[-1, 1]`.
/// * `mel` - `(B, M, F)` conditioning features, `F` frames of `M` channels.
/// * `voice` - `(B,)` speaker identity labels.
/// * `jitter` - `(B, F)` per-frame jitter labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub wav: Array2<f32>,
    pub mel: Array3<f32>,
    pub voice: Array1<u32>,
    pub jitter: Array2<u32>,
    pub position: RunPosition,
    pub paths: Vec<PathBuf>,
    device: Device,
}

impl Batch {
    /// Creates a new host resident `Batch`.
    ///
    /// # Returns
    /// The batch, or a `SizeMismatch` if the tensors disagree on the item count or frame count.
    pub fn new(
        wav: Array2<f32>,
        mel: Array3<f32>,
        voice: Array1<u32>,
        jitter: Array2<u32>,
        position: RunPosition,
        paths: Vec<PathBuf>,
    ) -> Result<Self> {
        let batch = Self {
            wav,
            mel,
            voice,
            jitter,
            position,
            paths,
            device: Device::Host,
        };

        batch.check_shapes()?;
        Ok(batch)
    }

    /// The number of items in the batch.
    pub fn len(&self) -> usize {
        self.wav.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The device this batch currently lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Moves the batch onto `device`.
    ///
    /// Every tensor is laid out contiguously on the way, which is what the device side expects.
    ///
    /// # Arguments
    /// * `device` - The target device.
    ///
    /// # Returns
    /// The relocated batch or an error if the batch is malformed.
    pub fn to(self, device: Device) -> Result<Self> {
        self.check_shapes()?;

        let Self {
            wav,
            mel,
            voice,
            jitter,
            position,
            paths,
            ..
        } = self;

        Ok(Self {
            wav: wav.as_standard_layout().into_owned(),
            mel: mel.as_standard_layout().into_owned(),
            voice: voice.as_standard_layout().into_owned(),
            jitter: jitter.as_standard_layout().into_owned(),
            position,
            paths,
            device,
        })
    }

    fn check_shapes(&self) -> Result<()> {
        let items = self.len();

        if items == 0 {
            return Err(MlErr::EmptyBatch);
        }

        let checks = [
            ("mel items", self.mel.dim().0),
            ("voice items", self.voice.len()),
            ("jitter items", self.jitter.nrows()),
            ("paths", self.paths.len()),
        ];

        for (what, got) in checks {
            if got != items {
                return Err(MlErr::SizeMismatch {
                    what,
                    got,
                    expected: items,
                });
            }
        }

        let frames = self.mel.dim().2;
        if self.jitter.ncols() != frames {
            return Err(MlErr::SizeMismatch {
                what: "jitter frames",
                got: self.jitter.ncols(),
                expected: frames,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, Array3};

    use super::*;

    fn batch(items: usize, frames: usize) -> Batch {
        Batch::new(
            Array2::zeros((items, 8)),
            Array3::zeros((items, 2, frames)),
            Array1::zeros(items),
            Array2::zeros((items, frames)),
            RunPosition::new(0, 0),
            vec![PathBuf::from("a.wav"); items],
        )
        .unwrap()
    }

    #[test]
    fn global_step_from_position() {
        assert_eq!(RunPosition::new(0, 7).global_step(120), 7);
        assert_eq!(RunPosition::new(2, 5).global_step(120), 245);
    }

    #[test]
    fn transfer_tags_device() {
        let b = batch(2, 3).to(Device::Accelerator(1)).unwrap();
        assert_eq!(b.device(), Device::Accelerator(1));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn transfer_rejects_inconsistent_batch() {
        let mut b = batch(2, 3);
        b.voice = Array1::zeros(3);
        assert!(matches!(
            b.to(Device::Host),
            Err(MlErr::SizeMismatch { what: "voice items", .. })
        ));
    }
}
