use log::debug;
use machine_learning::{Batch, Device, source::BatchIter};
use tokio::{sync::mpsc, task};

use crate::error::{Result, TrainErr};

/// Batches prefetched per replica by the parallel loader.
pub const PREFETCH: usize = 4;

/// A single pass sequence of batches already resident on their target device.
///
/// Ordering within the wrapped iterator is preserved. Transfer failures aren't retried, they
/// surface as `TrainErr::Transfer` and the caller is expected to stop.
pub enum DeviceLoader {
    /// Pulls and transfers each batch on demand.
    Direct { iter: BatchIter, device: Device },
    /// A blocking producer pulls and transfers ahead of the consumer.
    Parallel { rx: mpsc::Receiver<machine_learning::Result<Batch>> },
}

impl DeviceLoader {
    pub fn direct(iter: BatchIter, device: Device) -> Self {
        Self::Direct { iter, device }
    }

    /// Starts a producer thread filling a bounded queue.
    ///
    /// Must be called from within a tokio runtime. The producer stops once the queue is dropped.
    ///
    /// # Arguments
    /// * `iter` - This replica's shard of the batches.
    /// * `device` - Where every batch is moved to.
    /// * `prefetch` - The queue capacity.
    pub fn parallel(iter: BatchIter, device: Device, prefetch: usize) -> Self {
        let (tx, rx) = mpsc::channel(prefetch.max(1));

        task::spawn_blocking(move || {
            for item in iter {
                let failed = item.is_err();
                if tx.blocking_send(item.and_then(|b| b.to(device))).is_err() || failed {
                    break;
                }
            }
            debug!("parallel loader drained");
        });

        Self::Parallel { rx }
    }

    /// The next batch, or `None` once the sequence is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let item = match self {
            DeviceLoader::Direct { iter, device } => {
                iter.next().map(|item| item.and_then(|b| b.to(*device)))
            }
            DeviceLoader::Parallel { rx } => rx.recv().await,
        };

        item.transpose().map_err(TrainErr::Transfer)
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, path::PathBuf};

    use machine_learning::{
        MlErr, RunPosition,
        source::{BatchSource, HOP, InMemorySource, ShardSpec, SyntheticSpec},
    };

    use super::*;

    fn iter() -> BatchIter {
        InMemorySource::synthetic(SyntheticSpec {
            batches: 5,
            batch_size: NonZeroUsize::MIN,
            window: HOP,
            epochs: 1,
            sample_rate: 8_000,
            seed: 1,
        })
        .unwrap()
        .shard(ShardSpec::single(), RunPosition::default())
    }

    async fn drain(mut loader: DeviceLoader) -> Vec<(usize, Device)> {
        let mut out = Vec::new();
        while let Some(b) = loader.next_batch().await.unwrap() {
            out.push((b.position.batch, b.device()));
        }
        out
    }

    #[tokio::test]
    async fn direct_transfers_in_order() {
        let got = drain(DeviceLoader::direct(iter(), Device::Accelerator(0))).await;
        let expected: Vec<_> = (0..5).map(|i| (i, Device::Accelerator(0))).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parallel_preserves_order() {
        let got = drain(DeviceLoader::parallel(iter(), Device::Accelerator(1), 2)).await;
        let expected: Vec<_> = (0..5).map(|i| (i, Device::Accelerator(1))).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn transfer_failure_is_fatal() {
        let mut bad = iter().next().unwrap().unwrap();
        bad.paths.push(PathBuf::from("extra.wav"));
        let iter: BatchIter = Box::new(std::iter::once(Ok(bad)));

        let mut loader = DeviceLoader::direct(iter, Device::Host);
        assert!(matches!(
            loader.next_batch().await,
            Err(TrainErr::Transfer(MlErr::SizeMismatch { what: "paths", .. }))
        ));
    }
}
